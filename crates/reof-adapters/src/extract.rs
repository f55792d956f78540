//! Three-strategy field extractor: structured cards, anchor contexts, flat text.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use reof_core::{parse_decimal, CityProfile, RawFieldBundle};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::markers::CompiledMarkers;

static AREA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d[\d.,]*)\s*m(?:²|2)").expect("area regex"));
static ROOMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:quartos?|dormit[óo]rios?|dorms?\b)").expect("rooms regex")
});
static ROOMS_SHORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s?Q\b").expect("short rooms regex"));
static BATHROOMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:banheiros?|su[íi]tes?|wc\b)").expect("bathrooms regex")
});
static PARKING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:vagas?|garagens?)").expect("parking regex")
});
static PROPERTY_KIND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(casa|sobrado|apartamento|terreno|lote|ch[áa]cara|condom[íi]nio|kitnet|cobertura|sala comercial)\b",
    )
    .expect("property kind regex")
});

const BLOCK_TAGS: [&str; 4] = ["div", "article", "section", "li"];
const SKIPPED_TEXT_PARENTS: [&str; 3] = ["script", "style", "noscript"];
const TITLE_MIN_CHARS: usize = 10;
const TITLE_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    StructuredCard,
    AnchorContext,
    FlatText,
}

impl StrategyKind {
    /// Fallback order; the first strategy yielding at least one bundle wins.
    pub const ORDER: [StrategyKind; 3] = [
        StrategyKind::StructuredCard,
        StrategyKind::AnchorContext,
        StrategyKind::FlatText,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::StructuredCard => "structured_card",
            StrategyKind::AnchorContext => "anchor_context",
            StrategyKind::FlatText => "flat_text",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    /// Strategy whose bundles were kept; `None` when every strategy came up empty.
    pub strategy: Option<StrategyKind>,
    pub bundles: Vec<RawFieldBundle>,
    /// Strategies tried, in order, with the bundle count each produced.
    pub attempts: Vec<(StrategyKind, usize)>,
}

/// Run the strategies in order against one parsed page.
///
/// `base_url` resolves relative listing links. Extraction is pure: the same document
/// always yields the same outcome.
pub fn extract_page(
    document: &Html,
    base_url: Option<&Url>,
    profile: &CityProfile,
    markers: &CompiledMarkers,
) -> ExtractionOutcome {
    let extractor = Extractor {
        base_url,
        profile,
        markers,
    };
    let mut outcome = ExtractionOutcome::default();
    for strategy in StrategyKind::ORDER {
        let bundles = extractor.run(strategy, document);
        debug!(%strategy, bundles = bundles.len(), city = %profile.city, "extraction strategy finished");
        outcome.attempts.push((strategy, bundles.len()));
        if !bundles.is_empty() {
            outcome.strategy = Some(strategy);
            outcome.bundles = bundles;
            break;
        }
    }
    outcome
}

struct Extractor<'a> {
    base_url: Option<&'a Url>,
    profile: &'a CityProfile,
    markers: &'a CompiledMarkers,
}

impl Extractor<'_> {
    fn run(&self, strategy: StrategyKind, document: &Html) -> Vec<RawFieldBundle> {
        match strategy {
            StrategyKind::StructuredCard => self.structured_cards(document),
            StrategyKind::AnchorContext => self.anchor_contexts(document),
            StrategyKind::FlatText => self.flat_text(document),
        }
    }

    fn structured_cards(&self, document: &Html) -> Vec<RawFieldBundle> {
        let mut accepted = HashSet::new();
        let mut bundles = Vec::new();
        for card in document.select(&self.markers.card) {
            if accepted.len() >= self.markers.max_cards_per_page {
                break;
            }
            // Class-substring selectors also match a card's inner parts ("card-body").
            if card.ancestors().any(|a| accepted.contains(&a.id())) {
                continue;
            }
            let text = element_text(card);
            if text.is_empty() {
                continue;
            }
            accepted.insert(card.id());

            let fields = &self.markers.fields;
            let price = select_text(card, fields.price.as_ref())
                .filter(|p| p.chars().any(|c| c.is_ascii_digit()))
                .or_else(|| self.find_price(&text))
                .unwrap_or_default();
            if !self.plausible(&price) {
                continue;
            }
            let title = select_text(card, fields.title.as_ref())
                .filter(|t| t.chars().count() > 3)
                .unwrap_or_else(|| self.title_from(card, &text, &price));
            let link = self.pick_link(card).unwrap_or_default();

            bundles.push(RawFieldBundle {
                title,
                area: select_text(card, fields.area.as_ref()).unwrap_or_else(|| find_area(&text)),
                rooms: select_text(card, fields.rooms.as_ref()).unwrap_or_else(|| find_rooms(&text)),
                bathrooms: select_text(card, fields.bathrooms.as_ref())
                    .unwrap_or_else(|| find_capture(&BATHROOMS, &text)),
                parking: select_text(card, fields.parking.as_ref())
                    .unwrap_or_else(|| find_capture(&PARKING, &text)),
                address: select_text(card, fields.address.as_ref()).unwrap_or_default(),
                reference: self.find_reference(&text),
                link,
                price,
            });
        }
        bundles
    }

    fn anchor_contexts(&self, document: &Html) -> Vec<RawFieldBundle> {
        let mut seen = HashSet::new();
        let mut bundles = Vec::new();
        for anchor in document.select(&self.markers.anchor) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            if !self.markers.listing_link.is_match(href) {
                continue;
            }
            let context = anchor
                .ancestors()
                .take(self.markers.max_ancestor_depth)
                .filter_map(ElementRef::wrap)
                .find(|el| element_text(*el).chars().count() > self.markers.min_context_chars);
            let Some(context) = context else {
                continue;
            };
            if !seen.insert(context.id()) {
                continue;
            }
            if let Some(bundle) = self.reduce_context(context, Some(self.resolve(href))) {
                bundles.push(bundle);
            }
        }
        bundles
    }

    fn flat_text(&self, document: &Html) -> Vec<RawFieldBundle> {
        let mut seen = HashSet::new();
        let mut bundles = Vec::new();
        for node in document.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            if !self.markers.price_text.is_match(text) {
                continue;
            }
            let Some(parent) = node.parent().and_then(ElementRef::wrap) else {
                continue;
            };
            if SKIPPED_TEXT_PARENTS.contains(&parent.value().name()) {
                continue;
            }
            let context = parent
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|el| BLOCK_TAGS.contains(&el.value().name()));
            let Some(context) = context else {
                continue;
            };
            if !seen.insert(context.id()) {
                continue;
            }
            if let Some(bundle) = self.reduce_context(context, None) {
                bundles.push(bundle);
            }
        }
        bundles
    }

    /// Free-text reduction of one located context.
    fn reduce_context(&self, context: ElementRef<'_>, link: Option<String>) -> Option<RawFieldBundle> {
        let text = element_text(context);
        let price = self.find_price(&text)?;
        if !self.plausible(&price) {
            return None;
        }
        Some(RawFieldBundle {
            title: self.title_from(context, &text, &price),
            area: find_area(&text),
            rooms: find_rooms(&text),
            bathrooms: find_capture(&BATHROOMS, &text),
            parking: find_capture(&PARKING, &text),
            address: String::new(),
            reference: self.find_reference(&text),
            link: link.or_else(|| self.pick_link(context)).unwrap_or_default(),
            price,
        })
    }

    fn plausible(&self, price_text: &str) -> bool {
        let price = parse_decimal(price_text, self.markers.locale);
        let ok = self.markers.is_plausible_price(price);
        if !ok {
            debug!(price, "discarding context with implausible price");
        }
        ok
    }

    fn find_price(&self, text: &str) -> Option<String> {
        self.markers
            .price_text
            .find(text)
            .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
    }

    fn find_reference(&self, text: &str) -> String {
        self.markers
            .reference
            .as_ref()
            .and_then(|re| re.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    /// First listing-pattern link inside the context, else its first link.
    fn pick_link(&self, context: ElementRef<'_>) -> Option<String> {
        let hrefs = context
            .select(&self.markers.anchor)
            .filter_map(|a| a.value().attr("href"))
            .collect::<Vec<_>>();
        hrefs
            .iter()
            .find(|href| self.markers.listing_link.is_match(href))
            .or_else(|| hrefs.first())
            .map(|href| self.resolve(href))
    }

    fn resolve(&self, href: &str) -> String {
        match self.base_url.and_then(|base| base.join(href).ok()) {
            Some(url) => url.to_string(),
            None => href.trim().to_string(),
        }
    }

    fn title_from(&self, context: ElementRef<'_>, text: &str, price: &str) -> String {
        context
            .text()
            .map(collapse_whitespace)
            .find(|line| self.is_title_candidate(line))
            .unwrap_or_else(|| self.synthesize_title(text, price))
    }

    fn is_title_candidate(&self, line: &str) -> bool {
        let len = line.chars().count();
        len > TITLE_MIN_CHARS
            && len < TITLE_MAX_CHARS
            && !line.chars().all(|c| c.is_ascii_digit() || c.is_whitespace())
            && !line.contains(&self.markers.currency_marker)
            && PROPERTY_KIND.is_match(line)
    }

    fn synthesize_title(&self, text: &str, price: &str) -> String {
        let kind = PROPERTY_KIND
            .find(text)
            .map(|m| capitalize(m.as_str()))
            .unwrap_or_else(|| "Imóvel".to_string());
        let price = parse_decimal(price, self.markers.locale);
        format!(
            "{kind} em {} - {} {}",
            self.profile.city,
            self.markers.currency_marker,
            group_thousands(price, self.markers.locale.grouping)
        )
    }
}

fn select_text(scope: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let selector = selector?;
    scope
        .select(selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_area(text: &str) -> String {
    find_capture(&AREA, text)
}

fn find_rooms(text: &str) -> String {
    let rooms = find_capture(&ROOMS, text);
    if rooms.is_empty() {
        find_capture(&ROOMS_SHORT, text)
    } else {
        rooms
    }
}

fn find_capture(re: &Regex, text: &str) -> String {
    re.captures(text)
        .and_then(|caps| caps.get(0))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn group_thousands(value: f64, separator: char) -> String {
    let digits = format!("{:.0}", value.max(0.0));
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(separator);
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::ExtractionMarkers;
    use reof_core::NumberLocale;

    fn profile() -> CityProfile {
        CityProfile::new("Senador Canedo", "GO")
    }

    fn run(html: &str, markers: ExtractionMarkers) -> ExtractionOutcome {
        let compiled = markers.compile().expect("markers compile");
        let base = Url::parse("https://www.62imoveis.com.br/venda/go/senador-canedo/senador-canedo/imoveis")
            .expect("base url");
        extract_page(&Html::parse_document(html), Some(&base), &profile(), &compiled)
    }

    #[test]
    fn structured_cards_use_role_selectors_and_skip_nested_matches() {
        let html = r#"
            <div class="card listing">
              <div class="card-body">
                <h2 class="title">Casa 3 quartos no Jardim Europa</h2>
                <span class="price">R$ 280.000</span>
                <span class="area">150 m²</span>
                <span class="address">Jardim Europa, Senador Canedo</span>
                <p>3 quartos, 2 banheiros, 2 vagas. Ref: 154</p>
                <a href="/imovel/154">ver</a>
              </div>
            </div>
            <div class="card listing">
              <h2 class="title">Apartamento no Centro</h2>
              <span class="price">Consulte</span>
            </div>"#;
        let markers = ExtractionMarkers {
            title_selector: Some("h2.title".to_string()),
            price_selector: Some("span.price".to_string()),
            area_selector: Some("span.area".to_string()),
            address_selector: Some("span.address".to_string()),
            ..ExtractionMarkers::default()
        };
        let outcome = run(html, markers);
        assert_eq!(outcome.strategy, Some(StrategyKind::StructuredCard));
        assert_eq!(outcome.bundles.len(), 1);
        let bundle = &outcome.bundles[0];
        assert_eq!(bundle.title, "Casa 3 quartos no Jardim Europa");
        assert_eq!(bundle.price, "R$ 280.000");
        assert_eq!(bundle.area, "150 m²");
        assert_eq!(bundle.rooms, "3 quartos");
        assert_eq!(bundle.bathrooms, "2 banheiros");
        assert_eq!(bundle.parking, "2 vagas");
        assert_eq!(bundle.reference, "154");
        assert_eq!(bundle.link, "https://www.62imoveis.com.br/imovel/154");
    }

    #[test]
    fn falls_back_to_anchor_context_when_no_cards_match() {
        let html = r#"
            <ul>
              <li class="item">
                <p>Sobrado com 3 quartos no Setor Leste, lote de 250 m², 2 vagas de garagem,
                   ótima localização perto de escolas e comércio. R$ 420.000,00</p>
                <a href="/imovel/77">Detalhes</a>
              </li>
            </ul>"#;
        let outcome = run(html, ExtractionMarkers::default());
        assert_eq!(
            outcome.attempts,
            vec![(StrategyKind::StructuredCard, 0), (StrategyKind::AnchorContext, 1)]
        );
        let bundle = &outcome.bundles[0];
        assert_eq!(bundle.price, "R$ 420.000,00");
        assert_eq!(bundle.area, "250 m²");
        assert_eq!(bundle.link, "https://www.62imoveis.com.br/imovel/77");
        assert_eq!(bundle.title, "Sobrado em Senador Canedo - R$ 420.000");
    }

    #[test]
    fn flat_text_is_last_resort_and_synthesizes_titles() {
        let html = r#"
            <section>
              <div><span>R$ 195.000</span> 90 m² 2Q 1 vaga</div>
            </section>"#;
        let outcome = run(html, ExtractionMarkers::default());
        assert_eq!(
            outcome.attempts,
            vec![
                (StrategyKind::StructuredCard, 0),
                (StrategyKind::AnchorContext, 0),
                (StrategyKind::FlatText, 1)
            ]
        );
        let bundle = &outcome.bundles[0];
        assert_eq!(bundle.title, "Imóvel em Senador Canedo - R$ 195.000");
        assert_eq!(bundle.rooms, "2Q");
        assert_eq!(bundle.parking, "1 vaga");
        assert_eq!(bundle.link, "");
    }

    #[test]
    fn implausible_prices_are_discarded_and_empty_pages_yield_nothing() {
        let html = r#"<div><span>Aluguel R$ 1.200</span> casa 60 m²</div>"#;
        let outcome = run(html, ExtractionMarkers::default());
        assert_eq!(outcome.strategy, None);
        assert!(outcome.bundles.is_empty());
        assert_eq!(outcome.attempts.len(), 3);

        let outcome = run("<html><body><p>sem resultados</p></body></html>", ExtractionMarkers::default());
        assert!(outcome.bundles.is_empty());
    }

    #[test]
    fn extraction_is_repeatable() {
        let html = r#"<section><div>Casa térrea com quintal amplo R$ 310.000 200 m²</div></section>"#;
        let first = run(html, ExtractionMarkers::default());
        let second = run(html, ExtractionMarkers::default());
        assert_eq!(first, second);
        assert_eq!(first.bundles[0].title, "Casa em Senador Canedo - R$ 310.000");
    }

    #[test]
    fn area_keeps_grouping_and_decimal_separators() {
        let html = r#"<section><div>Chácara com casa sede R$ 800.000 área 1.000,00 m² 3 quartos</div></section>"#;
        let outcome = run(html, ExtractionMarkers::default());
        let area = &outcome.bundles[0].area;
        assert_eq!(area, "1.000,00 m²");
        assert_eq!(parse_decimal(area, NumberLocale::PT_BR), 1000.0);

        assert_eq!(find_area("lote 1.250,50 m2 plano"), "1.250,50 m2");
        assert_eq!(parse_decimal(&find_area("lote 1.250,50 m2 plano"), NumberLocale::PT_BR), 1250.5);
        assert_eq!(find_area("R$ 310.000 200 m²"), "200 m²");
    }

    #[test]
    fn groups_thousands_with_locale_separator() {
        assert_eq!(group_thousands(280_000.0, '.'), "280.000");
        assert_eq!(group_thousands(1_250_000.0, ','), "1,250,000");
        assert_eq!(group_thousands(950.0, '.'), "950");
    }
}
