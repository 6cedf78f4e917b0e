//! Turning classification results into field writes.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use enricher_shared::{
    FieldDef, FieldId, FieldKind, FieldValue, RecordValues, ResultMap, SchemaId,
};
use tracing::debug;

use crate::rules::Mapping;

/// A write the caller should persist.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub field: FieldId,
    pub field_name: String,
    pub value: PendingValue,
}

/// Value of a [`FieldWrite`].
#[derive(Debug, Clone, PartialEq)]
pub enum PendingValue {
    /// Store as-is.
    Value(FieldValue),
    /// Resolve each label to a canonical term of the field. With `merge`,
    /// union the terms with whatever the field already holds.
    Terms { labels: Vec<String>, merge: bool },
}

/// An assignment skipped because the result did not fit the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRejection {
    pub field: FieldId,
    pub field_name: String,
    pub reason: String,
}

/// Everything [`Mapping::apply`] decided for one subject's results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    pub writes: Vec<FieldWrite>,
    pub rejected: Vec<WriteRejection>,
}

impl ApplyOutcome {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.rejected.is_empty()
    }
}

impl Mapping {
    /// Compute the writes for results obtained from `source_field` of a
    /// record of `schema`.
    ///
    /// Never proposes a write over a value the record already holds, except
    /// to add terms to a multi-valued enumerable field. Values routed to the
    /// same destination by several rules are combined.
    pub fn apply(
        &self,
        schema: &SchemaId,
        source_field: &str,
        results: &ResultMap,
        existing: &RecordValues,
    ) -> ApplyOutcome {
        let mut by_category: HashMap<String, Vec<&str>> = HashMap::new();
        for (category, values) in results {
            by_category
                .entry(category.trim().to_lowercase())
                .or_default()
                .extend(values.iter().map(|v| v.trim()).filter(|v| !v.is_empty()));
        }

        // Destinations in first-seen order with their accumulated values.
        let mut targets: Vec<(&FieldDef, Vec<&str>)> = Vec::new();
        for block in self.blocks_for(schema, source_field) {
            for rule in &block.rules {
                let Some(values) = by_category.get(&rule.category.trim().to_lowercase()) else {
                    continue;
                };
                for dest in &rule.destinations {
                    let seen = targets.iter().position(|(f, _)| f.id == dest.id);
                    let slot = match seen {
                        Some(i) => &mut targets[i].1,
                        None => {
                            targets.push((dest, Vec::new()));
                            let last = targets.len() - 1;
                            &mut targets[last].1
                        }
                    };
                    for &value in values {
                        if !slot.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                            slot.push(value);
                        }
                    }
                }
            }
        }

        let mut outcome = ApplyOutcome::default();
        for (field, values) in targets {
            if values.is_empty() {
                continue;
            }
            let occupied = existing.get(&field.id).is_some_and(FieldValue::is_set);
            let appendable = field.kind == FieldKind::Enumerable && field.multi_valued;
            if occupied && !appendable {
                debug!(field = %field.name, "field already holds a value, not overwriting");
                continue;
            }

            match normalize(field, &values) {
                Ok(value) => outcome.writes.push(FieldWrite {
                    field: field.id.clone(),
                    field_name: field.name.clone(),
                    value,
                }),
                Err(reason) => outcome.rejected.push(WriteRejection {
                    field: field.id.clone(),
                    field_name: field.name.clone(),
                    reason,
                }),
            }
        }
        outcome
    }
}

/// Type-aware conversion of result values for `field`.
fn normalize(field: &FieldDef, values: &[&str]) -> Result<PendingValue, String> {
    let first = values[0];
    let value = match field.kind {
        FieldKind::Text => FieldValue::Text(values.join(", ")),
        FieldKind::Enumerable if field.multi_valued => {
            return Ok(PendingValue::Terms {
                labels: values.iter().map(|v| v.to_string()).collect(),
                merge: true,
            });
        }
        FieldKind::Enumerable => {
            return Ok(PendingValue::Terms {
                labels: vec![first.to_string()],
                merge: false,
            });
        }
        FieldKind::Number => FieldValue::Number(parse_number(first)?),
        FieldKind::Date => FieldValue::Date(parse_date(first)?),
        FieldKind::Flag => FieldValue::Flag(parse_flag(first)?),
        FieldKind::Url | FieldKind::File => {
            return Err(format!("fields of kind {} are not writable", field.kind));
        }
    };
    Ok(PendingValue::Value(value))
}

fn parse_number(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(format!("'{s}' is not a number")),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(s).map(|dt| dt.date_naive()))
        .map_err(|_| format!("'{s}' is not a date"))
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(format!("'{s}' is not a yes/no value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldCatalog;
    use enricher_shared::TermId;

    fn site() -> SchemaId {
        SchemaId::from("site")
    }

    fn field(id: &str, name: &str, kind: FieldKind, multi: bool) -> FieldDef {
        FieldDef {
            id: FieldId::from(id),
            schema: SchemaId::from("site"),
            name: name.into(),
            kind,
            multi_valued: multi,
        }
    }

    fn mapping() -> Mapping {
        let catalog = FieldCatalog::new([
            field("homepage", "Homepage", FieldKind::Url, false),
            field("cms", "Detected CMS", FieldKind::Text, false),
            field("tech", "Technologies", FieldKind::Enumerable, true),
            field("server", "Server", FieldKind::Enumerable, false),
            field("pages", "Page Count", FieldKind::Number, false),
            field("seen", "First Seen", FieldKind::Date, false),
            field("https", "Uses HTTPS", FieldKind::Flag, false),
        ]);
        let text = "\
SourceField: Homepage
Result: CMS
Field: Detected CMS; Technologies
Result: Frameworks
Field: Technologies
Result: Web servers
Field: Server
Result: Pages
Field: Page Count
Result: First seen
Field: First Seen
Result: TLS
Field: Uses HTTPS
";
        Mapping::parse(text, &catalog)
    }

    fn results(pairs: &[(&str, &[&str])]) -> ResultMap {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn write_for<'a>(outcome: &'a ApplyOutcome, id: &str) -> Option<&'a PendingValue> {
        outcome
            .writes
            .iter()
            .find(|w| w.field.as_str() == id)
            .map(|w| &w.value)
    }

    #[test]
    fn text_values_are_joined() {
        let outcome = mapping().apply(
            &site(),
            "Homepage",
            &results(&[("CMS", &["WordPress", "Drupal"])]),
            &RecordValues::new(),
        );
        assert_eq!(
            write_for(&outcome, "cms"),
            Some(&PendingValue::Value(FieldValue::Text("WordPress, Drupal".into())))
        );
    }

    #[test]
    fn enumerable_accumulates_across_rules() {
        let outcome = mapping().apply(
            &site(),
            "homepage",
            &results(&[("cms", &["WordPress"]), ("Frameworks", &["React", "wordpress"])]),
            &RecordValues::new(),
        );
        assert_eq!(
            write_for(&outcome, "tech"),
            Some(&PendingValue::Terms {
                labels: vec!["WordPress".into(), "React".into()],
                merge: true,
            })
        );
    }

    #[test]
    fn single_valued_enumerable_takes_first() {
        let outcome = mapping().apply(
            &site(),
            "Homepage",
            &results(&[("Web servers", &["nginx", "Apache"])]),
            &RecordValues::new(),
        );
        assert_eq!(
            write_for(&outcome, "server"),
            Some(&PendingValue::Terms {
                labels: vec!["nginx".into()],
                merge: false,
            })
        );
    }

    #[test]
    fn scalars_take_first_value() {
        let outcome = mapping().apply(
            &site(),
            "Homepage",
            &results(&[
                ("Pages", &["42", "7"]),
                ("First seen", &["2021-03-04T10:00:00Z"]),
                ("TLS", &["Yes"]),
            ]),
            &RecordValues::new(),
        );
        assert_eq!(
            write_for(&outcome, "pages"),
            Some(&PendingValue::Value(FieldValue::Number(42.0)))
        );
        assert_eq!(
            write_for(&outcome, "seen"),
            Some(&PendingValue::Value(FieldValue::Date(
                NaiveDate::from_ymd_opt(2021, 3, 4).unwrap()
            )))
        );
        assert_eq!(
            write_for(&outcome, "https"),
            Some(&PendingValue::Value(FieldValue::Flag(true)))
        );
    }

    #[test]
    fn existing_values_are_never_overwritten() {
        let mut existing = RecordValues::new();
        existing.insert(FieldId::from("cms"), FieldValue::Text("Joomla".into()));
        existing.insert(FieldId::from("pages"), FieldValue::Number(3.0));
        existing.insert(FieldId::from("server"), FieldValue::Terms(vec![TermId::from("t1")]));
        existing.insert(FieldId::from("tech"), FieldValue::Terms(vec![TermId::from("t2")]));

        let outcome = mapping().apply(
            &site(),
            "Homepage",
            &results(&[
                ("CMS", &["WordPress"]),
                ("Pages", &["42"]),
                ("Web servers", &["nginx"]),
            ]),
            &existing,
        );
        assert!(write_for(&outcome, "cms").is_none());
        assert!(write_for(&outcome, "pages").is_none());
        assert!(write_for(&outcome, "server").is_none());
        // Multi-valued enumerable fields still grow.
        assert!(matches!(
            write_for(&outcome, "tech"),
            Some(PendingValue::Terms { merge: true, .. })
        ));
    }

    #[test]
    fn unparseable_values_are_rejected_individually() {
        let outcome = mapping().apply(
            &site(),
            "Homepage",
            &results(&[("Pages", &["many"]), ("TLS", &["maybe"]), ("CMS", &["Ghost"])]),
            &RecordValues::new(),
        );
        assert_eq!(outcome.rejected.len(), 2);
        assert!(outcome.rejected.iter().any(|r| r.field.as_str() == "pages"));
        assert!(write_for(&outcome, "cms").is_some());
    }

    #[test]
    fn unknown_categories_and_sources_yield_nothing() {
        let m = mapping();
        assert!(m
            .apply(&site(), "Homepage", &results(&[("Unmapped", &["x"])]), &RecordValues::new())
            .is_empty());
        assert!(m
            .apply(&site(), "Other Field", &results(&[("CMS", &["x"])]), &RecordValues::new())
            .is_empty());
        // Blocks only apply to records of their source field's schema.
        assert!(m
            .apply(
                &SchemaId::from("article"),
                "Homepage",
                &results(&[("CMS", &["x"])]),
                &RecordValues::new()
            )
            .is_empty());
    }
}
