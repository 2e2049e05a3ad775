//! Structural validation of a parsed encryption configuration.
//!
//! Checks run in a fixed order so the reported error is deterministic for a
//! given document: document header, provider shape, KMS fields, key
//! material, then selector masking across the whole file.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::schema::{
    CURRENT_API_VERSION, CURRENT_KIND, EncryptionDocument, GroupResource, KeySpec,
    LEGACY_API_VERSION, LEGACY_KIND, ProviderSpec, SymmetricSpec,
};

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{path}: Invalid value: \"{value}\": {detail}")]
    Invalid {
        path: String,
        value: String,
        detail: String,
    },

    #[error("{path}: Required value: {detail}")]
    Required { path: String, detail: String },

    #[error("resource {resource} is masked by earlier rule {rule}")]
    Masked { resource: String, rule: String },
}

fn invalid(path: String, value: impl Into<String>, detail: impl Into<String>) -> ValidationError {
    ValidationError::Invalid {
        path,
        value: value.into(),
        detail: detail.into(),
    }
}

fn required(path: String, detail: impl Into<String>) -> ValidationError {
    ValidationError::Required {
        path,
        detail: detail.into(),
    }
}

/// Validates the whole document; returns the first violation found.
pub fn validate(doc: &EncryptionDocument) -> Result<(), ValidationError> {
    validate_header(doc)?;

    if doc.resources.is_empty() {
        return Err(required(
            "resources".to_string(),
            "at least one resource rule is required".to_string(),
        ));
    }

    for (i, rule) in doc.resources.iter().enumerate() {
        if rule.resources.is_empty() {
            return Err(required(
                format!("resources[{i}].resources"),
                "each rule must name at least one resource".to_string(),
            ));
        }
        if rule.providers.is_empty() {
            return Err(required(
                format!("resources[{i}].providers"),
                "each rule must list at least one provider".to_string(),
            ));
        }

        for (j, provider) in rule.providers.iter().enumerate() {
            validate_provider(provider, i, j)?;
        }
    }

    check_masking(doc)
}

fn validate_header(doc: &EncryptionDocument) -> Result<(), ValidationError> {
    match doc.kind.as_str() {
        CURRENT_KIND | LEGACY_KIND => {}
        other => {
            return Err(invalid(
                "kind".to_string(),
                other,
                format!("kind must be {CURRENT_KIND} or {LEGACY_KIND}"),
            ));
        }
    }
    match doc.api_version.as_str() {
        CURRENT_API_VERSION | LEGACY_API_VERSION => Ok(()),
        other => Err(invalid(
            "apiVersion".to_string(),
            other,
            format!("apiVersion must be {CURRENT_API_VERSION} or {LEGACY_API_VERSION}"),
        )),
    }
}

fn validate_provider(provider: &ProviderSpec, i: usize, j: usize) -> Result<(), ValidationError> {
    let path = format!("resources[{i}].providers[{j}]");
    if provider.variant_count() != 1 {
        return Err(invalid(
            path,
            "provider",
            "exactly one provider must be configured per entry",
        ));
    }

    if let Some(kms) = &provider.kms {
        let api_version = kms.api_version.as_deref().unwrap_or("v1");
        if api_version != "v1" && api_version != "v2" {
            return Err(invalid(
                format!("{path}.kms.apiVersion"),
                api_version,
                "unsupported apiVersion apiVersion for KMS provider, only v1 and v2 are supported",
            ));
        }
        if kms.name.is_empty() {
            return Err(required(
                format!("{path}.kms.name"),
                "KMS provider name is required".to_string(),
            ));
        }
        if api_version == "v2" && kms.name.contains(':') {
            return Err(invalid(
                format!("{path}.kms.name"),
                kms.name.clone(),
                "KMS v2 provider names must not contain ':'",
            ));
        }
        if kms.endpoint.is_empty() {
            return Err(required(
                format!("{path}.kms.endpoint"),
                "KMS provider endpoint is required".to_string(),
            ));
        }
    }

    if let Some(spec) = &provider.aesgcm {
        validate_keys(spec, &format!("{path}.aesgcm"), &[16, 24, 32])?;
    }
    if let Some(spec) = &provider.aescbc {
        validate_keys(spec, &format!("{path}.aescbc"), &[32])?;
    }
    if let Some(spec) = &provider.secretbox {
        validate_keys(spec, &format!("{path}.secretbox"), &[32])?;
    }
    Ok(())
}

fn validate_keys(
    spec: &SymmetricSpec,
    path: &str,
    allowed_lengths: &[usize],
) -> Result<(), ValidationError> {
    if spec.keys.is_empty() {
        return Err(required(
            format!("{path}.keys"),
            "at least one key is required".to_string(),
        ));
    }
    for (k, key) in spec.keys.iter().enumerate() {
        validate_key(key, &format!("{path}.keys[{k}]"), allowed_lengths)?;
    }
    Ok(())
}

fn validate_key(
    key: &KeySpec,
    path: &str,
    allowed_lengths: &[usize],
) -> Result<(), ValidationError> {
    if key.name.is_empty() {
        return Err(required(
            format!("{path}.name"),
            "key name is required".to_string(),
        ));
    }

    let decoded = STANDARD.decode(&key.secret).map_err(|_| {
        invalid(
            format!("{path}.secret"),
            "REDACTED",
            "secrets must be base64 encoded",
        )
    })?;

    if !allowed_lengths.contains(&decoded.len()) {
        let expected = allowed_lengths
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(invalid(
            format!("{path}.secret"),
            "REDACTED",
            format!("key must be {expected} bytes, got {}", decoded.len()),
        ));
    }
    Ok(())
}

/// Rejects selectors fully subsumed by an earlier wildcard, scanning the
/// flattened selector sequence in file order. `*.*` masks any later
/// selector; a group wildcard masks later bare selectors of its group;
/// between wildcards only strict containment masks.
fn check_masking(doc: &EncryptionDocument) -> Result<(), ValidationError> {
    let mut earlier: Vec<(String, GroupResource)> = Vec::new();

    for rule in &doc.resources {
        for selector in &rule.resources {
            let parsed = GroupResource::parse(selector);

            for (spelling, mask) in &earlier {
                if mask.is_universal() {
                    return Err(ValidationError::Masked {
                        resource: selector.clone(),
                        rule: spelling.clone(),
                    });
                }
                if mask.is_group_wildcard()
                    && !parsed.is_universal()
                    && !parsed.is_group_wildcard()
                    && parsed.group == mask.group
                {
                    return Err(ValidationError::Masked {
                        resource: selector.clone(),
                        rule: format!("'{spelling}'"),
                    });
                }
            }

            earlier.push((selector.clone(), parsed));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> EncryptionDocument {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn doc_with_rules(rules: &str) -> EncryptionDocument {
        doc(&format!(
            "apiVersion: apiserver.config.k8s.io/v1\nkind: EncryptionConfiguration\nresources:\n{rules}"
        ))
    }

    const AES_KEY: &str = "QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE=";

    #[test]
    fn accepts_a_well_formed_document() {
        let doc = doc_with_rules(&format!(
            "  - resources: [secrets]\n    providers:\n      - aesgcm:\n          keys:\n            - name: key1\n              secret: {AES_KEY}\n"
        ));
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn rejects_unknown_kind() {
        let doc = doc(
            "apiVersion: apiserver.config.k8s.io/v1\nkind: SomethingElse\nresources:\n  - resources: [secrets]\n    providers:\n      - identity: {}\n",
        );
        assert!(matches!(
            validate(&doc),
            Err(ValidationError::Invalid { path, .. }) if path == "kind"
        ));
    }

    #[test]
    fn rejects_provider_with_no_variant() {
        let doc = doc_with_rules("  - resources: [secrets]\n    providers:\n      - {}\n");
        let err = validate(&doc).unwrap_err();
        assert_eq!(
            err.to_string(),
            "resources[0].providers[0]: Invalid value: \"provider\": exactly one provider must be configured per entry"
        );
    }

    #[test]
    fn rejects_provider_with_two_variants() {
        let doc = doc_with_rules(&format!(
            "  - resources: [secrets]\n    providers:\n      - identity: {{}}\n        aesgcm:\n          keys:\n            - name: key1\n              secret: {AES_KEY}\n"
        ));
        assert!(validate(&doc).is_err());
    }

    #[test]
    fn rejects_unsupported_kms_api_version() {
        let doc = doc_with_rules(
            "  - resources: [secrets]\n    providers:\n      - kms:\n          apiVersion: v3\n          name: foo\n          endpoint: unix:///tmp/kms.sock\n",
        );
        let err = validate(&doc).unwrap_err();
        assert_eq!(
            err.to_string(),
            "resources[0].providers[0].kms.apiVersion: Invalid value: \"v3\": unsupported apiVersion apiVersion for KMS provider, only v1 and v2 are supported"
        );
    }

    #[test]
    fn rejects_undecodable_secret() {
        let doc = doc_with_rules(
            "  - resources: [secrets]\n    providers:\n      - aesgcm:\n          keys:\n            - name: key1\n              secret: 'not base64!'\n",
        );
        let err = validate(&doc).unwrap_err();
        assert!(err.to_string().contains("secrets must be base64 encoded"));
    }

    #[test]
    fn rejects_wrong_key_length() {
        // 8 bytes, valid base64.
        let doc = doc_with_rules(
            "  - resources: [secrets]\n    providers:\n      - secretbox:\n          keys:\n            - name: key1\n              secret: QUFBQUFBQUE=\n",
        );
        let err = validate(&doc).unwrap_err();
        assert!(err.to_string().contains("key must be 32 bytes, got 8"));
    }

    #[test]
    fn core_group_wildcard_masks_bare_resource() {
        let doc = doc_with_rules(
            "  - resources: [configmaps, '*.', secrets]\n    providers:\n      - kms:\n          apiVersion: v1\n          name: foo\n          endpoint: unix:///tmp/kms.sock\n",
        );
        let err = validate(&doc).unwrap_err();
        assert_eq!(
            err.to_string(),
            "resource secrets is masked by earlier rule '*.'"
        );
    }

    #[test]
    fn universal_wildcard_masks_later_rule() {
        let doc = doc_with_rules(
            "  - resources: ['*.*']\n    providers:\n      - identity: {}\n  - resources: [secrets]\n    providers:\n      - identity: {}\n",
        );
        let err = validate(&doc).unwrap_err();
        assert_eq!(
            err.to_string(),
            "resource secrets is masked by earlier rule *.*"
        );
    }

    #[test]
    fn universal_wildcard_masks_group_wildcard() {
        let doc = doc_with_rules(
            "  - resources: ['*.*']\n    providers:\n      - identity: {}\n  - resources: ['*.']\n    providers:\n      - identity: {}\n",
        );
        let err = validate(&doc).unwrap_err();
        assert_eq!(err.to_string(), "resource *. is masked by earlier rule *.*");
    }

    #[test]
    fn group_wildcard_masks_resource_of_its_group() {
        let doc = doc_with_rules(
            "  - resources: ['*.apps']\n    providers:\n      - identity: {}\n  - resources: [deployments.apps]\n    providers:\n      - identity: {}\n",
        );
        let err = validate(&doc).unwrap_err();
        assert_eq!(
            err.to_string(),
            "resource deployments.apps is masked by earlier rule '*.apps'"
        );
    }

    #[test]
    fn group_wildcard_does_not_mask_other_groups() {
        let doc = doc_with_rules(
            "  - resources: ['*.apps']\n    providers:\n      - identity: {}\n  - resources: [secrets]\n    providers:\n      - identity: {}\n",
        );
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn same_form_wildcards_do_not_mask_each_other() {
        let doc = doc_with_rules(
            "  - resources: ['*.apps']\n    providers:\n      - identity: {}\n  - resources: ['*.batch']\n    providers:\n      - identity: {}\n",
        );
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn group_wildcard_does_not_mask_the_universal_wildcard() {
        let doc = doc_with_rules(
            "  - resources: ['*.apps']\n    providers:\n      - identity: {}\n  - resources: ['*.*']\n    providers:\n      - identity: {}\n",
        );
        assert!(validate(&doc).is_ok());
    }
}
