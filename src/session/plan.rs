use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::checkpoint::RESERVED_COLUMNS;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("extraction plan has no anchor")]
    MissingAnchor,
    #[error("extraction plan has no fields")]
    NoFields,
    #[error("duplicate field name `{0}`")]
    DuplicateField(String),
    #[error("field name `{0}` collides with a reserved output column")]
    ReservedField(String),
    #[error("invalid pattern for field `{field}`: {source}")]
    Pattern {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
}

fn default_required() -> bool {
    true
}

/// How to pull one field out of the located element.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Selector relative to the anchor; the anchor itself when absent.
    #[serde(default)]
    pub selector: Option<String>,
    /// Attribute to read instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
    /// Regex applied to the raw value; first capture group wins.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Join all matches with this separator instead of taking the first.
    #[serde(default)]
    pub join: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl FieldSpec {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: Some(selector.into()),
            attr: None,
            pattern: None,
            join: None,
            required: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub anchor: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug)]
pub struct CompiledField {
    pub spec: FieldSpec,
    pattern: Option<Regex>,
}

impl CompiledField {
    /// Apply the field pattern and trim. `None` means the value is unusable.
    ///
    /// Joined fields are split on their separator and each part is refined
    /// on its own; parts the pattern rejects are dropped.
    pub fn refine(&self, raw: &str) -> Option<String> {
        let Some(sep) = self.spec.join.as_deref().filter(|s| !s.is_empty()) else {
            return self.refine_one(raw);
        };
        let parts: Vec<String> = raw.split(sep).filter_map(|part| self.refine_one(part)).collect();
        (!parts.is_empty()).then(|| parts.join(sep))
    }

    fn refine_one(&self, raw: &str) -> Option<String> {
        let value = match &self.pattern {
            Some(re) => {
                let caps = re.captures(raw.trim())?;
                caps.get(1).or_else(|| caps.get(0))?.as_str()
            }
            None => raw,
        };
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

/// Caller-supplied anchor and field selection for one page layout.
#[derive(Debug)]
pub struct ExtractionPlan {
    pub anchor: String,
    pub fields: Vec<CompiledField>,
}

impl ExtractionPlan {
    pub fn compile(config: PlanConfig) -> Result<Self, PlanError> {
        if config.anchor.trim().is_empty() {
            return Err(PlanError::MissingAnchor);
        }
        if config.fields.is_empty() {
            return Err(PlanError::NoFields);
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(config.fields.len());
        for spec in config.fields {
            if RESERVED_COLUMNS.contains(&spec.name.as_str()) {
                return Err(PlanError::ReservedField(spec.name));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(PlanError::DuplicateField(spec.name));
            }
            let pattern = spec
                .pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|source| PlanError::Pattern {
                    field: spec.name.clone(),
                    source,
                })?;
            fields.push(CompiledField { spec, pattern });
        }

        Ok(Self {
            anchor: config.anchor,
            fields,
        })
    }

    /// Every selector the plan uses, anchor first.
    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.anchor.as_str())
            .chain(self.fields.iter().filter_map(|f| f.spec.selector.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fields: Vec<FieldSpec>) -> PlanConfig {
        PlanConfig {
            anchor: "div.store".into(),
            fields,
        }
    }

    #[test]
    fn coordinates_pattern_takes_first_group() {
        let mut lat = FieldSpec::new("latitude", "span.mapsLink a");
        lat.attr = Some("href".into());
        lat.pattern = Some(r"destination=([-+]?\d+\.\d+),".into());
        let plan = ExtractionPlan::compile(config(vec![lat])).unwrap();
        let url = "https://maps.google.com/?api=1&destination=45.4642,9.1900";
        assert_eq!(plan.fields[0].refine(url).as_deref(), Some("45.4642"));
        assert_eq!(plan.fields[0].refine("https://maps.google.com/"), None);
    }

    #[test]
    fn joined_values_are_filtered_one_by_one() {
        let mut docs = FieldSpec::new("documents", "a");
        docs.attr = Some("href".into());
        docs.pattern = Some(r"(.*\.pdf)$".into());
        docs.join = Some("; ".into());
        let plan = ExtractionPlan::compile(config(vec![docs])).unwrap();
        assert_eq!(
            plan.fields[0].refine("/a.pdf; /b.html; /c.pdf").as_deref(),
            Some("/a.pdf; /c.pdf")
        );
        assert_eq!(plan.fields[0].refine("/b.html; /d.htm"), None);
    }

    #[test]
    fn blank_values_are_unusable() {
        let plan = ExtractionPlan::compile(config(vec![FieldSpec::new("name", "h1")])).unwrap();
        assert_eq!(plan.fields[0].refine("   "), None);
        assert_eq!(plan.fields[0].refine("  PAM Milano "), Some("PAM Milano".into()));
    }

    #[test]
    fn rejects_bad_plans() {
        assert!(matches!(
            ExtractionPlan::compile(PlanConfig::default()),
            Err(PlanError::MissingAnchor)
        ));
        assert!(matches!(
            ExtractionPlan::compile(config(vec![])),
            Err(PlanError::NoFields)
        ));
        assert!(matches!(
            ExtractionPlan::compile(config(vec![FieldSpec::new("status", "p")])),
            Err(PlanError::ReservedField(_))
        ));
        assert!(matches!(
            ExtractionPlan::compile(config(vec![
                FieldSpec::new("name", "h1"),
                FieldSpec::new("name", "h2")
            ])),
            Err(PlanError::DuplicateField(_))
        ));
        let mut bad = FieldSpec::new("zip", "p");
        bad.pattern = Some("(".into());
        assert!(matches!(
            ExtractionPlan::compile(config(vec![bad])),
            Err(PlanError::Pattern { .. })
        ));
    }
}
