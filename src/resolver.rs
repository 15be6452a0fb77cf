//! Promotion rule resolution.
//!
//! Rules are keyed by human strings (a class name or its form label) and point at
//! another human string. Matching is a strict priority chain, first hit wins:
//! exact name, exact form, normalized name, normalized form, base-name of name,
//! base-name of form. The successor string is then mapped back onto the live
//! class directory with a similar chain. There is no scoring: for a given input
//! the answer is always the same and can be explained by the tier that matched.

use crate::model::{ClassRef, PromotionRuleTable, PromotionRules, COMPLETED_SENTINEL};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

// Levels are either numeric ("Grade 2A" -> 2) or alphabetic ("ECD B" -> b), so a
// trailing section letter on a numeric level does not change the family.
static BASE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(grade|form|ecd)\s*([0-9]+|[a-z]+)").expect("base-name pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchTier {
    ExactName,
    ExactForm,
    NormalizedName,
    NormalizedForm,
    BaseName,
    BaseForm,
    /// Id-keyed rule record.
    Linked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub tier: MatchTier,
    pub key: String,
    pub successor: String,
}

impl RuleMatch {
    pub fn is_terminal(&self) -> bool {
        self.successor == COMPLETED_SENTINEL
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub next_class: Option<ClassRef>,
    pub rule: Option<RuleMatch>,
}

/// Trim, lowercase and collapse runs of whitespace to a single space.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical `(family, level)` of names like "Grade 2A", "form  3", "ECD B".
pub fn base_name(s: &str) -> Option<(String, String)> {
    let norm = normalize(s);
    let caps = BASE_NAME_RE.captures(&norm)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

fn hit(tier: MatchTier, key: &str, successor: &str) -> RuleMatch {
    RuleMatch {
        tier,
        key: key.to_string(),
        successor: successor.to_string(),
    }
}

fn scan(
    rules: &PromotionRuleTable,
    tier: MatchTier,
    pred: impl Fn(&str) -> bool,
) -> Option<RuleMatch> {
    rules
        .iter()
        .find(|(k, _)| pred(k.as_str()))
        .map(|(k, v)| hit(tier, k, v))
}

/// Which rule applies to `class`, and how it was found.
pub fn explain(class: &ClassRef, rules: &PromotionRuleTable) -> Option<RuleMatch> {
    if rules.is_empty() {
        return None;
    }
    let name = class.name.as_str();
    let form = class.form.as_str();

    for (ident, tier) in [(name, MatchTier::ExactName), (form, MatchTier::ExactForm)] {
        if ident.is_empty() {
            continue;
        }
        if let Some(v) = rules.get(ident) {
            return Some(hit(tier, ident, v));
        }
    }

    for (ident, tier) in [
        (name, MatchTier::NormalizedName),
        (form, MatchTier::NormalizedForm),
    ] {
        let want = normalize(ident);
        if want.is_empty() {
            continue;
        }
        if let Some(m) = scan(rules, tier, |k| normalize(k) == want) {
            return Some(m);
        }
    }

    for (ident, tier) in [(name, MatchTier::BaseName), (form, MatchTier::BaseForm)] {
        let Some(want) = base_name(ident) else {
            continue;
        };
        if let Some(m) = scan(rules, tier, |k| base_name(k).as_ref() == Some(&want)) {
            return Some(m);
        }
    }

    None
}

/// Successor class for `class`, or `None` when there is no rule, the rule is
/// terminal, or it names a class that does not exist.
pub fn resolve(
    class: &ClassRef,
    rules: &PromotionRuleTable,
    all_classes: &[ClassRef],
) -> Option<ClassRef> {
    let m = explain(class, rules)?;
    if m.is_terminal() {
        return None;
    }
    find_class_by_name(&m.successor, all_classes).cloned()
}

/// Maps a successor string onto the class directory.
pub fn find_class_by_name<'a>(target: &str, all_classes: &'a [ClassRef]) -> Option<&'a ClassRef> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }

    if let Some(c) = first_match(all_classes, |s| s == target) {
        return Some(c);
    }

    let want = normalize(target);
    if let Some(c) = first_match(all_classes, |s| normalize(s) == want) {
        return Some(c);
    }

    if let Some(want_base) = base_name(target) {
        if let Some(c) = first_match(all_classes, |s| base_name(s).as_ref() == Some(&want_base)) {
            return Some(c);
        }
    }

    first_match(all_classes, |s| {
        let have = normalize(s);
        !have.is_empty() && (have.starts_with(&want) || want.starts_with(&have))
    })
}

// Names first, then forms, each in directory order.
fn first_match<'a>(all_classes: &'a [ClassRef], pred: impl Fn(&str) -> bool) -> Option<&'a ClassRef> {
    all_classes
        .iter()
        .find(|c| !c.name.trim().is_empty() && pred(&c.name))
        .or_else(|| {
            all_classes
                .iter()
                .find(|c| !c.form.trim().is_empty() && pred(&c.form))
        })
}

impl PromotionRules {
    /// Id-keyed records are authoritative for the classes they cover; the string
    /// table only applies to classes without a record.
    pub fn resolve_for(&self, class: &ClassRef, all_classes: &[ClassRef]) -> Resolution {
        if let Some(rec) = self.linked.iter().find(|r| r.from_class_id == class.id) {
            let target = if rec.is_final_class {
                None
            } else {
                rec.to_class_id.as_deref()
            };
            let next_class = target.and_then(|id| all_classes.iter().find(|c| c.id == id).cloned());
            if target.is_some() && next_class.is_none() {
                tracing::warn!(
                    class_id = %class.id,
                    to_class_id = ?rec.to_class_id,
                    "promotion link points to a class that does not exist"
                );
            }
            let successor = target.unwrap_or(COMPLETED_SENTINEL).to_string();
            return Resolution {
                next_class,
                rule: Some(RuleMatch {
                    tier: MatchTier::Linked,
                    key: rec.from_class_id.clone(),
                    successor,
                }),
            };
        }

        let rule = explain(class, &self.named);
        let next_class = resolve(class, &self.named, all_classes);
        if let Some(m) = rule.as_ref().filter(|m| !m.is_terminal() && next_class.is_none()) {
            tracing::warn!(
                class = %class.name,
                successor = %m.successor,
                "promotion rule names a class that does not exist"
            );
        }
        Resolution { next_class, rule }
    }
}
