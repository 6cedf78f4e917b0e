//! Subject extraction: which keys a record contributes to the external check.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use enricher_mapping::FieldCatalog;
use enricher_shared::{
    FieldValue, RecordValues, SchemaId, Subject, SubjectFieldConfig, SubjectKind, SubjectSource,
};
use regex::Regex;
use tracing::debug;
use url::{Host, Url};

// ---------------------------------------------------------------------------
// URL canonicalization
// ---------------------------------------------------------------------------

/// Canonical form of a web address, or `None` if it is not one.
///
/// A missing scheme defaults to https. Host is lowercased, the fragment is
/// dropped, and a trailing slash is trimmed when there is no query.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    let mut url = Url::parse(&candidate).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    url.set_fragment(None);

    let mut canonical = url.to_string();
    if url.query().is_none() {
        while canonical.ends_with('/') {
            canonical.pop();
        }
    }
    Some(canonical)
}

// ---------------------------------------------------------------------------
// Exclusions
// ---------------------------------------------------------------------------

enum HostPattern {
    /// The host itself or any subdomain of it.
    Domain(String),
    Glob(Regex),
}

/// Static deny-list of hosts plus non-public targets.
pub struct HostFilter {
    patterns: Vec<HostPattern>,
}

impl HostFilter {
    pub fn new(hosts: &[String]) -> Self {
        let patterns = hosts
            .iter()
            .map(|h| h.trim().trim_end_matches('.').to_lowercase())
            .filter(|h| !h.is_empty())
            .filter_map(|h| {
                if h.contains('*') {
                    glob_to_regex(&h).map(HostPattern::Glob)
                } else {
                    Some(HostPattern::Domain(h))
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether requests about `url` must never be sent.
    pub fn excludes(&self, url: &Url) -> bool {
        let Some(host) = url.host() else {
            return true;
        };
        if is_non_public(&host) {
            return true;
        }
        let Host::Domain(name) = host else {
            return false;
        };
        let name = name.trim_end_matches('.');
        self.patterns.iter().any(|p| match p {
            HostPattern::Domain(d) => {
                name == d.as_str()
                    || name
                        .strip_suffix(d.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            HostPattern::Glob(re) => re.is_match(name),
        })
    }
}

/// `*` matches any run of characters, dots included.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$")).ok()
}

fn is_non_public(host: &Host<&str>) -> bool {
    match host {
        Host::Ipv4(v4) => is_private_v4(v4),
        Host::Ipv6(v6) => is_private_v6(v6),
        Host::Domain(name) => {
            *name == "localhost"
                || name.ends_with(".localhost")
                || name.ends_with(".local")
                || name.ends_with(".internal")
        }
    }
}

fn is_private_v4(v4: &Ipv4Addr) -> bool {
    let [a, b, c, _] = v4.octets();
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_unspecified()
        // 100.64.0.0/10 (carrier-grade NAT)
        || (a == 100 && (b & 0xC0) == 64)
        || (a == 192 && b == 0 && c == 0)
}

fn is_private_v6(v6: &Ipv6Addr) -> bool {
    if let Some(v4) = v6.to_ipv4_mapped() {
        return is_private_v4(&v4);
    }
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        // fc00::/7 unique local, fe80::/10 link-local
        || (first & 0xFE00) == 0xFC00
        || (first & 0xFFC0) == 0xFE80
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Derives subjects from record values according to `[[subject_fields]]`.
pub struct SubjectExtractor {
    fields: Vec<SubjectFieldConfig>,
    filter: HostFilter,
}

impl SubjectExtractor {
    pub fn new(fields: Vec<SubjectFieldConfig>, excluded_hosts: &[String]) -> Self {
        Self {
            fields,
            filter: HostFilter::new(excluded_hosts),
        }
    }

    /// Subjects of one record, deduplicated by key, in configuration order.
    ///
    /// A key read from several fields becomes one subject listing every
    /// field, so it is sent once and its results feed each field's blocks.
    pub fn subjects_for(
        &self,
        schema: &SchemaId,
        values: &RecordValues,
        catalog: &FieldCatalog,
    ) -> Vec<Subject> {
        let mut subjects: Vec<Subject> = Vec::new();

        for config in self.fields.iter().filter(|f| f.schema == schema.as_str()) {
            let Some(field) = catalog.by_name(schema, &config.field) else {
                debug!(field = %config.field, %schema, "subject field not in catalog");
                continue;
            };
            let Some(raw) = values.get(&field.id).and_then(FieldValue::as_text) else {
                continue;
            };
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            match config.kind {
                SubjectSource::Url => {
                    let Some(canonical) = canonicalize_url(raw) else {
                        debug!(field = %field.name, value = raw, "not a usable URL");
                        continue;
                    };
                    let excluded = Url::parse(&canonical).map_or(true, |u| self.filter.excludes(&u));
                    if excluded {
                        debug!(subject = %canonical, "excluded host");
                        continue;
                    }
                    add_subject(&mut subjects, canonical, SubjectKind::Url, &field.name, BTreeMap::new());
                }
                SubjectSource::Document => {
                    for question in config.questions.iter().map(|q| q.trim()) {
                        if question.is_empty() {
                            continue;
                        }
                        add_subject(
                            &mut subjects,
                            format!("file:{raw}#q:{question}"),
                            SubjectKind::Document,
                            &field.name,
                            BTreeMap::from([
                                ("file".to_string(), raw.to_string()),
                                ("question".to_string(), question.to_string()),
                            ]),
                        );
                    }
                }
            }
        }
        subjects
    }
}

/// Append a subject, or record one more source field on an existing key.
fn add_subject(
    subjects: &mut Vec<Subject>,
    key: String,
    kind: SubjectKind,
    field_name: &str,
    params: BTreeMap<String, String>,
) {
    if let Some(existing) = subjects.iter_mut().find(|s| s.key == key) {
        if !existing.source_fields.iter().any(|f| f == field_name) {
            existing.source_fields.push(field_name.to_string());
        }
        return;
    }
    subjects.push(Subject {
        key,
        kind,
        source_fields: vec![field_name.to_string()],
        params,
    });
}
