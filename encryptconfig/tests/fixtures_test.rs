//! End-to-end compilation of the fixture configurations: grace-period
//! contract values and cross-configuration rotation behavior.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use encryptconfig::schema::GroupResource;
use encryptconfig::{EncryptionConfiguration, HealthChecker as _, load_encryption_configuration};
use envelope::ValueTransformer as _;
use envelope::service::LocalEnvelopeServiceFactory;

const PLAINTEXT: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DATA_CTX: &[u8] = b"0123456789";

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("testdata")
        .join(name)
}

async fn compile(name: &str) -> EncryptionConfiguration {
    // Shared KMS key so transformers built from different fixtures can read
    // each other's values, the way one server does across reloads.
    let factory = LocalEnvelopeServiceFactory::new(&[42u8; 32], "key-1");
    load_encryption_configuration(&fixture(name), &factory, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("{name} should compile: {err}"))
}

#[tokio::test]
async fn fixture_grace_periods_match_the_contract() {
    let expectations = [
        ("identity-first.yaml", 46),
        ("aes-gcm-first.yaml", 32),
        ("aes-cbc-first.yaml", 26),
        ("secret-box-first.yaml", 14),
        ("kms-first.yaml", 34),
        ("kmsv2-first.yaml", 42),
    ];

    for (name, seconds) in expectations {
        let config = compile(name).await;
        assert_eq!(
            config.kms_close_grace_period,
            Duration::from_secs(seconds),
            "grace period of {name}"
        );
    }
}

#[tokio::test]
async fn every_fixture_compiles_to_one_aggregate_health_check() {
    for name in [
        "identity-first.yaml",
        "aes-gcm-first.yaml",
        "aes-cbc-first.yaml",
        "secret-box-first.yaml",
        "kms-first.yaml",
        "kmsv2-first.yaml",
    ] {
        let config = compile(name).await;
        assert_eq!(config.health_checks.len(), 1, "{name}");
        assert_eq!(config.health_checks[0].name(), "kms-providers");
        assert!(config.health_checks[0].check().await.is_ok(), "{name}");
    }
}

/// Values written by one configuration's primary decrypt under every sibling
/// configuration; the read is stale exactly when the sibling's primary
/// differs from the writer's.
#[tokio::test]
async fn cross_configuration_reads_flag_rotation() {
    let fixtures = [
        "identity-first.yaml",
        "aes-gcm-first.yaml",
        "aes-cbc-first.yaml",
        "secret-box-first.yaml",
        "kms-first.yaml",
    ];
    let secrets = GroupResource::new("", "secrets");

    for producer_name in fixtures {
        let producer = compile(producer_name).await;
        let stored = producer
            .transformers
            .get(&secrets)
            .unwrap()
            .transform_to_storage(PLAINTEXT, DATA_CTX)
            .await
            .unwrap_or_else(|err| panic!("{producer_name} encrypt: {err}"));

        for consumer_name in fixtures {
            let consumer = compile(consumer_name).await;
            let (plaintext, stale) = consumer
                .transformers
                .get(&secrets)
                .unwrap()
                .transform_from_storage(&stored, DATA_CTX)
                .await
                .unwrap_or_else(|err| {
                    panic!("{consumer_name} reading {producer_name} data: {err}")
                });

            assert_eq!(plaintext, PLAINTEXT, "{consumer_name} <- {producer_name}");
            assert_eq!(
                stale,
                producer_name != consumer_name,
                "staleness of {consumer_name} reading {producer_name} data"
            );
        }
    }
}

#[tokio::test]
async fn kms_v2_fixture_round_trips() {
    let config = compile("kmsv2-first.yaml").await;
    let secrets = GroupResource::new("", "secrets");

    let transformer = config.transformers.get(&secrets).unwrap();
    let stored = transformer
        .transform_to_storage(PLAINTEXT, DATA_CTX)
        .await
        .unwrap();
    assert!(stored.starts_with(b"k8s:enc:kms:v2:sandbox-v2:"));

    let (plaintext, stale) = transformer
        .transform_from_storage(&stored, DATA_CTX)
        .await
        .unwrap();
    assert_eq!(plaintext, PLAINTEXT);
    assert!(!stale);
}
