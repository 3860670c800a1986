//! Normalised pricing model.
//!
//! A model's price schedule is a list of components, each pricing one
//! direction×modality at some unit. Cost computation walks the token buckets
//! of a usage report, picks the best-matching component per bucket and applies
//! the unit arithmetic. Buckets without a matching component cost nothing;
//! pricing gaps are a catalogue problem, never a request failure.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
    Tool,
    Cache,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "input" => Some(Direction::Input),
            "output" => Some(Direction::Output),
            "tool" => Some(Direction::Tool),
            "cache" => Some(Direction::Cache),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
    Tool,
    Generic,
}

impl Modality {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(Modality::Text),
            "image" => Some(Modality::Image),
            "audio" => Some(Modality::Audio),
            "video" => Some(Modality::Video),
            "tool" => Some(Modality::Tool),
            "generic" => Some(Modality::Generic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceUnit {
    #[serde(rename = "token")]
    Token,
    #[serde(rename = "1k_tokens")]
    PerThousandTokens,
    #[serde(rename = "character")]
    Character,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "pixel")]
    Pixel,
    #[serde(rename = "second")]
    Second,
    #[serde(rename = "page")]
    Page,
    #[serde(rename = "gb_per_day")]
    GbPerDay,
}

impl PriceUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "token" => Some(PriceUnit::Token),
            "1k_tokens" => Some(PriceUnit::PerThousandTokens),
            "character" => Some(PriceUnit::Character),
            "image" => Some(PriceUnit::Image),
            "pixel" => Some(PriceUnit::Pixel),
            "second" => Some(PriceUnit::Second),
            "page" => Some(PriceUnit::Page),
            "gb_per_day" => Some(PriceUnit::GbPerDay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceTier {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "above_128k")]
    Above128k,
    #[serde(rename = "above_200k")]
    Above200k,
    #[serde(rename = "priority")]
    Priority,
    #[serde(rename = "flex")]
    Flex,
    #[serde(rename = "premium")]
    Premium,
}

impl PriceTier {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Some(PriceTier::Default),
            "above_128k" => Some(PriceTier::Above128k),
            "above_200k" => Some(PriceTier::Above200k),
            "priority" => Some(PriceTier::Priority),
            "flex" => Some(PriceTier::Flex),
            "premium" => Some(PriceTier::Premium),
            _ => None,
        }
    }
}

/// One priced dimension of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingComponent {
    pub direction: Direction,
    pub modality: Modality,
    pub unit: PriceUnit,
    pub tier: Option<PriceTier>,
    pub scope: Option<String>,
    /// Price per unit, in the model's currency.
    pub price: f64,
}

/// Token counts extracted from a provider response. Lives only within one
/// request scope.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageReport {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub total_tokens: i64,
}

impl UsageReport {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cached_tokens == 0
            && self.reasoning_tokens == 0
    }
}

/// Compute the cost of `usage` against a component list, in the schedule's
/// currency.
///
/// Bucket mapping: input→(input,text), output→(output,text),
/// cached→(cache,text), reasoning→(output,text). When several components
/// match a bucket, the one with a default (or absent) tier wins; otherwise
/// the first match in stable component order.
pub fn cost_for_usage(components: &[PricingComponent], usage: &UsageReport) -> f64 {
    let buckets = [
        (usage.input_tokens, Direction::Input, Modality::Text),
        (usage.output_tokens, Direction::Output, Modality::Text),
        (usage.cached_tokens, Direction::Cache, Modality::Text),
        (usage.reasoning_tokens, Direction::Output, Modality::Text),
    ];

    let mut total = 0.0;
    for (tokens, direction, modality) in buckets {
        if tokens <= 0 {
            continue;
        }
        if let Some(component) = best_component(components, direction, modality) {
            total += token_cost(component.unit, tokens, component.price);
        }
    }
    total.max(0.0)
}

fn best_component(
    components: &[PricingComponent],
    direction: Direction,
    modality: Modality,
) -> Option<&PricingComponent> {
    let mut first_match = None;
    for component in components {
        if component.direction != direction || component.modality != modality {
            continue;
        }
        if matches!(component.tier, None | Some(PriceTier::Default)) {
            return Some(component);
        }
        if first_match.is_none() {
            first_match = Some(component);
        }
    }
    first_match
}

fn token_cost(unit: PriceUnit, tokens: i64, price: f64) -> f64 {
    match unit {
        PriceUnit::PerThousandTokens => tokens as f64 / 1000.0 * price,
        PriceUnit::Token => tokens as f64 * price,
        // 4-chars-per-token approximation for character-priced schedules.
        PriceUnit::Character => tokens as f64 * 4.0 * price,
        // Non-token units never apply on the token path.
        _ => 0.0,
    }
}
