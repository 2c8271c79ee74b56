//! Trigger rules for fast, model-free classification.
//!
//! Each rule is a compiled regex over the folded message text (see
//! [`normalize`]). The router asks whether a message is address-intent; the
//! media planner asks about contact and video signals. Keyword lists from
//! [`RuleSet`] are escaped and compiled; raw patterns can be added for
//! anything keywords cannot express.
//!
//! [`RulesEngine::resolve_region`] maps a message's location to a store,
//! a district question or the out-of-coverage reply.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::config::{RuleSet, StoreEntry};
use crate::error::ConfigError;
use crate::pipeline::text::{contains_any, normalize};

/// What a trigger rule signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Address,
    Purchase,
    Contact,
    Video,
}

/// Where a message's location points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionRoute<'a> {
    /// A store serves the region.
    Store(&'a StoreEntry),
    /// A city with several stores, no district given.
    NeedDistrict { city: String },
    /// No store serves the region.
    OutOfCoverage { region: String },
    Unknown,
}

impl RegionRoute<'_> {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Place names ending in an administrative suffix, e.g. 黑龙江省.
/// A trailing Han character means the suffix is part of another word
/// (区别, 市场) and the match is skipped.
fn region_mention() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([\x{4e00}-\x{9fa5}]{2,8}(?:省|市|区|县|州|盟|旗))([\x{4e00}-\x{9fa5}])?")
            .expect("static regex")
    })
}

/// First place name with an administrative suffix in `text`.
pub fn extract_region(text: &str) -> Option<String> {
    region_mention()
        .captures_iter(text)
        .filter(|c| c.get(2).is_none())
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_start_matches(['我', '人', '在', '是', '住']))
        .find(|r| r.chars().count() >= 2)
        .map(str::to_string)
}

/// A single compiled trigger.
#[derive(Debug, Clone)]
pub struct TriggerRule {
    /// Source pattern (for logs).
    pub pattern: String,
    /// Compiled regex, matched against folded text.
    pub regex: Regex,
    pub kind: TriggerKind,
}

/// Signals raised by one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub address: bool,
    pub purchase: bool,
    pub contact: bool,
    pub video: bool,
}

#[derive(Debug, Clone)]
struct StoreRule {
    store: StoreEntry,
    keywords: Vec<String>,
}

/// Trigger rules engine.
#[derive(Debug, Clone)]
pub struct RulesEngine {
    rules: Vec<TriggerRule>,
    stores: Vec<StoreRule>,
    covered_cities: Vec<String>,
    district_cities: Vec<String>,
    outside_all_label: String,
    non_coverage: Vec<String>,
    /// Every place name the engine knows, for spotting location replies.
    geo_names: Vec<String>,
}

impl RulesEngine {
    /// Compile a rules engine from keyword sets.
    pub fn from_rule_set(set: &RuleSet) -> Result<Self, ConfigError> {
        let mut engine = Self::empty();
        for (kind, keywords) in [
            (TriggerKind::Address, &set.address_triggers),
            (TriggerKind::Purchase, &set.purchase_triggers),
            (TriggerKind::Contact, &set.contact_signals),
            (TriggerKind::Video, &set.video_triggers),
        ] {
            for keyword in keywords {
                engine.add_keyword(keyword, kind)?;
            }
        }
        engine.stores = set
            .stores
            .iter()
            .map(|store| StoreRule {
                store: store.clone(),
                keywords: store
                    .keywords
                    .iter()
                    .map(|k| normalize(k))
                    .filter(|k| !k.is_empty())
                    .collect(),
            })
            .collect();

        let fold_all = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|i| normalize(i))
                .filter(|i| !i.is_empty())
                .collect()
        };
        engine.covered_cities = fold_all(&set.covered_cities);
        engine.district_cities = fold_all(&set.district_cities);
        engine.non_coverage = fold_all(&set.non_coverage_regions);
        engine.outside_all_label = set.outside_all_label.clone();
        engine.geo_names = engine
            .stores
            .iter()
            .flat_map(|s| s.keywords.iter().cloned())
            .chain(engine.covered_cities.iter().cloned())
            .chain(engine.non_coverage.iter().cloned())
            .collect();
        Ok(engine)
    }

    /// An engine with no rules (everything falls through).
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            stores: Vec::new(),
            covered_cities: Vec::new(),
            district_cities: Vec::new(),
            outside_all_label: String::new(),
            non_coverage: Vec::new(),
            geo_names: Vec::new(),
        }
    }

    /// Add a literal keyword. Blank keywords are ignored.
    pub fn add_keyword(&mut self, keyword: &str, kind: TriggerKind) -> Result<(), ConfigError> {
        let folded = normalize(keyword);
        if folded.is_empty() {
            return Ok(());
        }
        self.add_pattern(&regex::escape(&folded), kind)
    }

    /// Add a raw regex, matched against folded text.
    pub fn add_pattern(&mut self, pattern: &str, kind: TriggerKind) -> Result<(), ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.rules.push(TriggerRule {
            pattern: pattern.to_string(),
            regex,
            kind,
        });
        Ok(())
    }

    /// Whether any rule of `kind` matches `text`.
    pub fn matches(&self, kind: TriggerKind, text: &str) -> bool {
        let folded = normalize(text);
        self.matches_folded(kind, &folded)
    }

    fn matches_folded(&self, kind: TriggerKind, folded: &str) -> bool {
        let hit = self
            .rules
            .iter()
            .filter(|r| r.kind == kind)
            .find(|r| r.regex.is_match(folded));
        if let Some(rule) = hit {
            debug!(kind = ?kind, rule = %rule.pattern, "Message matched trigger rule");
            true
        } else {
            false
        }
    }

    /// Evaluate every trigger kind at once.
    pub fn evaluate(&self, text: &str) -> Signals {
        let folded = normalize(text);
        Signals {
            address: self.matches_folded(TriggerKind::Address, &folded),
            purchase: self.matches_folded(TriggerKind::Purchase, &folded),
            contact: self.matches_folded(TriggerKind::Contact, &folded),
            video: self.matches_folded(TriggerKind::Video, &folded),
        }
    }

    /// First store whose region keywords appear in `text`.
    pub fn match_store(&self, text: &str) -> Option<&StoreEntry> {
        self.store_for(&normalize(text))
    }

    fn store_for(&self, folded: &str) -> Option<&StoreEntry> {
        self.stores
            .iter()
            .find(|s| s.keywords.iter().any(|k| folded.contains(k.as_str())))
            .map(|s| &s.store)
    }

    /// Resolve the location named in `text`.
    ///
    /// Order: "not in <covered city>", store keywords, multi-store city
    /// without a district, regions without a store.
    pub fn resolve_region(&self, text: &str) -> RegionRoute<'_> {
        let folded = normalize(text);
        if folded.is_empty() {
            return RegionRoute::Unknown;
        }

        if let Some(region) = self.negated_region(&folded) {
            return RegionRoute::OutOfCoverage { region };
        }
        if let Some(store) = self.store_for(&folded) {
            return RegionRoute::Store(store);
        }
        if let Some(city) = self.district_cities.iter().find(|c| folded.contains(c.as_str())) {
            return RegionRoute::NeedDistrict { city: city.clone() };
        }
        if let Some(hit) = self.non_coverage.iter().find(|r| folded.contains(r.as_str())) {
            let region = extract_region(text)
                .filter(|r| r.contains(hit.as_str()))
                .unwrap_or_else(|| hit.clone());
            return RegionRoute::OutOfCoverage { region };
        }
        RegionRoute::Unknown
    }

    /// "不在上海" style answers.
    fn negated_region(&self, folded: &str) -> Option<String> {
        let (_, rest) = folded.split_once("不在")?;
        let named: Vec<&String> = self
            .covered_cities
            .iter()
            .filter(|c| rest.contains(c.as_str()))
            .collect();
        match named.as_slice() {
            [] => None,
            [city] => Some(format!("非{city}地区")),
            _ => Some(self.outside_all_label.clone()),
        }
    }

    /// Whether `text` reads like an answer to "where are you".
    pub fn looks_like_geo_reply(&self, text: &str) -> bool {
        !self.resolve_region(text).is_unknown()
            || contains_any(text, &self.geo_names)
            || extract_region(text).is_some()
    }
}
