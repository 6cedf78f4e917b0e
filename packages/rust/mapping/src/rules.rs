//! Field resolution for scanned blocks: strict validation and tolerant parsing.

use enricher_shared::{CategoryConfig, FieldDef, FieldKind, SchemaId};
use tracing::debug;

use crate::MappingError;
use crate::catalog::FieldCatalog;
use crate::grammar::{RawBlock, scan};

/// One `Result:` category routed to its destination fields.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingRule {
    pub category: String,
    pub destinations: Vec<FieldDef>,
}

/// A source field and the rules applied to its results.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBlock {
    pub source: FieldDef,
    pub rules: Vec<MappingRule>,
}

/// A resolved mapping, ready to apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    pub(crate) blocks: Vec<ActionBlock>,
}

impl Mapping {
    /// Resolve `text` for runtime use.
    ///
    /// Blocks that no longer resolve (a referenced field was deleted or
    /// changed kind since the text was accepted) are dropped one by one;
    /// the remaining blocks still apply.
    pub fn parse(text: &str, catalog: &FieldCatalog) -> Self {
        let scanned = scan(text);
        for err in &scanned.errors {
            debug!(line = err.line, problem = %err.message, "skipping malformed mapping block");
        }

        let mut blocks = Vec::with_capacity(scanned.blocks.len());
        for raw in &scanned.blocks {
            match resolve_block(raw, catalog, &[]) {
                Ok(resolved) => blocks.extend(resolved),
                Err(problems) => {
                    for problem in problems {
                        debug!(
                            source_field = %raw.source_field,
                            line = problem.line,
                            problem = %problem.message,
                            "dropping mapping block"
                        );
                    }
                }
            }
        }
        Self { blocks }
    }

    pub fn blocks(&self) -> &[ActionBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks whose source field is `source_field` (case-insensitive) of `schema`.
    pub fn blocks_for<'a>(
        &'a self,
        schema: &'a SchemaId,
        source_field: &'a str,
    ) -> impl Iterator<Item = &'a ActionBlock> {
        self.blocks.iter().filter(move |b| {
            b.source.schema == *schema && b.source.name.eq_ignore_ascii_case(source_field.trim())
        })
    }
}

/// Check `text` against the field catalog and the known result categories.
///
/// Fail-closed: any problem rejects the whole text, and every problem found
/// is returned. An empty `categories` list disables category checks.
pub fn validate(
    text: &str,
    catalog: &FieldCatalog,
    categories: &[CategoryConfig],
) -> Result<Mapping, Vec<MappingError>> {
    let scanned = scan(text);
    let mut errors = scanned.errors;
    let mut blocks = Vec::with_capacity(scanned.blocks.len());

    for raw in &scanned.blocks {
        match resolve_block(raw, catalog, categories) {
            Ok(resolved) => blocks.extend(resolved),
            Err(problems) => errors.extend(problems),
        }
    }

    if errors.is_empty() && blocks.is_empty() {
        errors.push(MappingError::new(0, "mapping defines no blocks"));
    }

    if errors.is_empty() {
        Ok(Mapping { blocks })
    } else {
        errors.sort_by_key(|e| e.line);
        Err(errors)
    }
}

/// Resolve one scanned block, collecting every problem in it.
///
/// A source field name may exist in several schemas; the block is resolved
/// in each of them and kept wherever all its destinations resolve. When it
/// resolves nowhere, the problems of the closest schema are reported.
fn resolve_block(
    raw: &RawBlock,
    catalog: &FieldCatalog,
    categories: &[CategoryConfig],
) -> Result<Vec<ActionBlock>, Vec<MappingError>> {
    let candidates = catalog.named(&raw.source_field);
    let Some(first) = candidates.first() else {
        return Err(vec![MappingError::new(
            raw.line,
            format!("unknown source field '{}'", raw.source_field),
        )]);
    };

    let sources: Vec<&FieldDef> = candidates.iter().copied().filter(|f| f.kind.is_source()).collect();
    if sources.is_empty() {
        return Err(vec![MappingError::new(
            raw.line,
            format!("field '{}' of kind {} cannot be a source", first.name, first.kind),
        )]);
    }

    let mut resolved = Vec::new();
    let mut closest: Option<Vec<MappingError>> = None;
    for source in sources {
        match resolve_in_schema(raw, source, catalog, categories) {
            Ok(block) => resolved.push(block),
            Err(problems) => {
                if closest.as_ref().is_none_or(|c| problems.len() < c.len()) {
                    closest = Some(problems);
                }
            }
        }
    }

    if resolved.is_empty() {
        Err(closest.unwrap_or_default())
    } else {
        Ok(resolved)
    }
}

/// Resolve the actions of `raw` against the schema of `source`.
fn resolve_in_schema(
    raw: &RawBlock,
    source: &FieldDef,
    catalog: &FieldCatalog,
    categories: &[CategoryConfig],
) -> Result<ActionBlock, Vec<MappingError>> {
    let mut problems = Vec::new();
    let mut rules = Vec::with_capacity(raw.actions.len());

    for action in &raw.actions {
        let category = if categories.is_empty() {
            None
        } else {
            let known = categories
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&action.category));
            if known.is_none() {
                problems.push(MappingError::new(
                    action.line,
                    format!("unknown result category '{}'", action.category),
                ));
            }
            known
        };

        let mut destinations = Vec::with_capacity(action.fields.len());
        for name in &action.fields {
            let Some(dest) = catalog.by_name(&source.schema, name) else {
                let message = match catalog.named(name).first() {
                    Some(other) => format!(
                        "field '{}' belongs to schema '{}', not '{}' of source field '{}'",
                        other.name, other.schema, source.schema, source.name
                    ),
                    None => format!("unknown destination field '{name}'"),
                };
                problems.push(MappingError::new(action.line, message));
                continue;
            };
            if !dest.kind.is_destination() {
                problems.push(MappingError::new(
                    action.line,
                    format!("field '{}' of kind {} cannot receive results", dest.name, dest.kind),
                ));
                continue;
            }
            let emits_several = category.is_some_and(|c| c.multiple);
            if emits_several && dest.kind == FieldKind::Enumerable && !dest.multi_valued {
                problems.push(MappingError::new(
                    action.line,
                    format!(
                        "category '{}' may return several results but field '{}' holds a single value",
                        action.category, dest.name
                    ),
                ));
                continue;
            }
            destinations.push(dest.clone());
        }

        rules.push(MappingRule {
            category: action.category.clone(),
            destinations,
        });
    }

    if problems.is_empty() {
        Ok(ActionBlock {
            source: source.clone(),
            rules,
        })
    } else {
        Err(problems)
    }
}
