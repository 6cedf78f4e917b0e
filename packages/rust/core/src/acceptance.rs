//! Mapping acceptance: the operator validates mapping text once, and runs
//! only start against exactly that text.

use enricher_mapping::{FieldCatalog, Mapping, rejected, validate};
use enricher_shared::{CategoryConfig, EnricherError, Result};
use enricher_storage::Storage;
use sha2::{Digest, Sha256};
use tracing::info;

const TEXT_KEY: &str = "mapping.text";
const FINGERPRINT_KEY: &str = "mapping.sha256";

/// SHA-256 of the mapping text, hex encoded.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Validate `text` and, only if it is clean, record it as the accepted mapping.
pub async fn accept_mapping(
    storage: &Storage,
    text: &str,
    catalog: &FieldCatalog,
    categories: &[CategoryConfig],
) -> Result<Mapping> {
    let mapping = validate(text, catalog, categories).map_err(|errors| rejected(&errors))?;
    let digest = fingerprint(text);
    storage.set_setting(TEXT_KEY, text).await?;
    storage.set_setting(FINGERPRINT_KEY, &digest).await?;
    info!(fingerprint = %digest, blocks = mapping.blocks().len(), "mapping accepted");
    Ok(mapping)
}

/// Fingerprint of the accepted mapping, if any.
pub async fn accepted_fingerprint(storage: &Storage) -> Result<Option<String>> {
    storage.get_setting(FINGERPRINT_KEY).await
}

/// Resolve the configured mapping for a run.
///
/// Fails with a configuration error unless `text` is the accepted text.
/// Blocks whose fields disappeared since acceptance are dropped silently.
pub async fn load_accepted_mapping(
    storage: &Storage,
    text: &str,
    catalog: &FieldCatalog,
) -> Result<Mapping> {
    let Some(accepted) = accepted_fingerprint(storage).await? else {
        return Err(EnricherError::config(
            "no mapping has been accepted; run `enricher mapping accept` first",
        ));
    };
    if accepted != fingerprint(text) {
        return Err(EnricherError::config(
            "configured mapping differs from the accepted one; run `enricher mapping accept`",
        ));
    }
    Ok(Mapping::parse(text, catalog))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{site_fields, temp_storage};

    const TEXT: &str = "SourceField: Homepage\nResult: CMS\nField: Detected CMS\n";

    fn categories() -> Vec<CategoryConfig> {
        vec![CategoryConfig {
            name: "CMS".into(),
            multiple: false,
        }]
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(fingerprint(TEXT), fingerprint("SourceField: Docs"));
    }

    #[tokio::test]
    async fn accepted_text_loads() {
        let storage = temp_storage().await;
        let catalog = FieldCatalog::new(site_fields());

        accept_mapping(&storage, TEXT, &catalog, &categories()).await.unwrap();
        let mapping = load_accepted_mapping(&storage, TEXT, &catalog).await.unwrap();
        assert_eq!(mapping.blocks().len(), 1);
    }

    #[tokio::test]
    async fn invalid_text_is_never_accepted() {
        let storage = temp_storage().await;
        let catalog = FieldCatalog::new(site_fields());
        let bad = "SourceField: Homepage\nResult: CMS\nField: Nope\n";

        let err = accept_mapping(&storage, bad, &catalog, &categories())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Nope"));
        assert_eq!(accepted_fingerprint(&storage).await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_refuses_unaccepted_or_changed_text() {
        let storage = temp_storage().await;
        let catalog = FieldCatalog::new(site_fields());

        let err = load_accepted_mapping(&storage, TEXT, &catalog).await.unwrap_err();
        assert!(err.is_configuration());

        accept_mapping(&storage, TEXT, &catalog, &categories()).await.unwrap();
        let edited = format!("{TEXT}Result: Server\nField: Server\n");
        let err = load_accepted_mapping(&storage, &edited, &catalog).await.unwrap_err();
        assert!(err.to_string().contains("differs"));
    }
}
