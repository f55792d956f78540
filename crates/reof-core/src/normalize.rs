//! Raw text -> typed listing coercion.

use std::sync::LazyLock;

use regex::Regex;

use crate::{CityProfile, NormalizedListing, NumberLocale, RawFieldBundle};

/// Generic neighborhood shapes tried when no priority zone matches.
static ZONE_HEURISTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:jardins?|setor|residencial|condom[íi]nio|vila|parque|loteamento)\s+(?:(?:d[aeo]s?)\s+)?[\p{L}\d]+",
    )
    .expect("zone heuristic regex")
});

/// Heuristic matches longer than this are treated as free text, not a zone name.
const MAX_ZONE_LEN: usize = 50;

/// Coerce one raw bundle into a typed listing. Never rejects; validation happens later.
pub fn normalize(bundle: &RawFieldBundle, profile: &CityProfile) -> NormalizedListing {
    let locale = profile.number_locale;
    let price = parse_decimal(&bundle.price, locale);
    let area = parse_decimal(&bundle.area, locale);
    let price_per_area = if area > 0.0 {
        round_cents(price / area)
    } else {
        0.0
    };

    let title = collapse_whitespace(&bundle.title);
    let address = collapse_whitespace(&bundle.address);
    let neighborhood = resolve_neighborhood(&format!("{address}\n{title}"), profile);
    let address = if address.is_empty() {
        format!("{}, {}/{}", neighborhood, profile.city, profile.state)
    } else {
        address
    };
    let reference = Some(bundle.reference.trim().to_string()).filter(|r| !r.is_empty());

    NormalizedListing {
        title,
        price,
        area,
        price_per_area,
        rooms: parse_count(&bundle.rooms),
        bathrooms: parse_count(&bundle.bathrooms),
        parking_spaces: parse_count(&bundle.parking),
        neighborhood,
        address,
        source_url: bundle.link.trim().to_string(),
        reference,
    }
}

/// Parse the first contiguous digit/separator run of `text`.
///
/// Grouping separators are dropped and the decimal separator becomes `.`; anything
/// unparsable becomes `0.0`.
pub fn parse_decimal(text: &str, locale: NumberLocale) -> f64 {
    let mut run = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            run.push(ch);
            continue;
        }
        if !run.is_empty() && (ch == locale.grouping || ch == locale.decimal) {
            run.push(ch);
            continue;
        }
        if !run.is_empty() {
            break;
        }
    }

    let trimmed = run.trim_end_matches(|c: char| !c.is_ascii_digit());
    let canonical = trimmed
        .chars()
        .filter(|c| *c != locale.grouping)
        .map(|c| if c == locale.decimal { '.' } else { c })
        .collect::<String>();
    canonical
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0)
}

/// Parse the first integer in `text`; missing or overflowing values become `0`.
pub fn parse_count(text: &str) -> u32 {
    text.chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

/// Resolve a neighborhood name from free text.
///
/// Priority zones win in declared order (case-insensitive substring), then the generic
/// heuristics, then the city name.
pub fn resolve_neighborhood(text: &str, profile: &CityProfile) -> String {
    let haystack = text.to_lowercase();
    if haystack.trim().is_empty() {
        return profile.city.clone();
    }

    if let Some(zone) = profile
        .priority_zones
        .iter()
        .find(|zone| !zone.trim().is_empty() && haystack.contains(&zone.to_lowercase()))
    {
        return zone.clone();
    }

    ZONE_HEURISTIC
        .find(text)
        .map(|m| title_case(m.as_str()))
        .filter(|zone| zone.chars().count() < MAX_ZONE_LEN)
        .unwrap_or_else(|| profile.city.clone())
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            if matches!(lower.as_str(), "da" | "das" | "de" | "do" | "dos") {
                return lower;
            }
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::senador_canedo;

    #[test]
    fn parses_brazilian_currency_and_area_text() {
        let locale = NumberLocale::PT_BR;
        assert_eq!(parse_decimal("R$ 280.000,00", locale), 280_000.0);
        assert_eq!(parse_decimal("R$ 1.250.000", locale), 1_250_000.0);
        assert_eq!(parse_decimal("120,5 m²", locale), 120.5);
        assert_eq!(parse_decimal("Área: 1.200 m²", locale), 1_200.0);
        assert_eq!(parse_decimal("Consulte", locale), 0.0);
        assert_eq!(parse_decimal("", locale), 0.0);
    }

    #[test]
    fn parses_first_run_only() {
        let locale = NumberLocale::PT_BR;
        assert_eq!(parse_decimal("150 m² / 3 quartos", locale), 150.0);
        assert_eq!(parse_decimal("R$ 350.000, aceita troca", locale), 350_000.0);
    }

    #[test]
    fn respects_other_locales() {
        assert_eq!(parse_decimal("$1,250,000.50", NumberLocale::EN_US), 1_250_000.5);
    }

    #[test]
    fn counts_default_to_zero() {
        assert_eq!(parse_count("3 quartos"), 3);
        assert_eq!(parse_count("quartos"), 0);
        assert_eq!(parse_count("99999999999 vagas"), 0);
    }

    #[test]
    fn priority_zones_match_in_declared_order() {
        let profile = senador_canedo();
        assert_eq!(
            resolve_neighborhood("Rua 5, JARDIM EUROPA - próximo ao Centro", &profile),
            "Jardim Europa"
        );
        assert_eq!(resolve_neighborhood("Centro", &profile), "Centro");
    }

    #[test]
    fn heuristics_then_city_fallback() {
        let profile = senador_canedo();
        assert_eq!(
            resolve_neighborhood("Casa no residencial pienza, lote 12", &profile),
            "Residencial Pienza"
        );
        assert_eq!(
            resolve_neighborhood("Sobrado no parque das flores", &profile),
            "Parque das Flores"
        );
        assert_eq!(resolve_neighborhood("Rua 10, quadra 3", &profile), "Senador Canedo");
        assert_eq!(resolve_neighborhood("", &profile), "Senador Canedo");
    }

    #[test]
    fn normalize_derives_price_per_area_and_address() {
        let profile = senador_canedo();
        let bundle = RawFieldBundle {
            title: "  Casa   3 quartos  ".to_string(),
            price: "R$ 280.000".to_string(),
            area: "150 m²".to_string(),
            rooms: "3 quartos".to_string(),
            parking: "2 vagas".to_string(),
            address: "Jardim Europa".to_string(),
            link: "https://www.62imoveis.com.br/imovel/10".to_string(),
            ..Default::default()
        };
        let listing = normalize(&bundle, &profile);
        assert_eq!(listing.title, "Casa 3 quartos");
        assert_eq!(listing.price_per_area, 1866.67);
        assert_eq!(listing.rooms, 3);
        assert_eq!(listing.bathrooms, 0);
        assert_eq!(listing.parking_spaces, 2);
        assert_eq!(listing.neighborhood, "Jardim Europa");
        assert_eq!(listing.reference, None);
    }

    #[test]
    fn normalize_never_rejects_empty_bundles() {
        let profile = senador_canedo();
        let listing = normalize(&RawFieldBundle::default(), &profile);
        assert_eq!(listing.price, 0.0);
        assert_eq!(listing.price_per_area, 0.0);
        assert_eq!(listing.neighborhood, "Senador Canedo");
        assert_eq!(listing.address, "Senador Canedo, Senador Canedo/GO");
    }
}
