//! End-to-end reload behavior over a real file on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use encryptconfig::load_encryption_configuration;
use encryptconfig::schema::GroupResource;
use envelope::ValueTransformer as _;
use envelope::service::{
    EnvelopeServiceFactory, KmsError, KmsService, KmsServiceV2, LocalEnvelopeService,
};
use reload::{DynamicTransformers, ReloadController, TransformerGeneration};

const POLL: Duration = Duration::from_millis(50);

fn config_body(primary: &str, secondary: &str) -> String {
    format!(
        "apiVersion: apiserver.config.k8s.io/v1\n\
         kind: EncryptionConfiguration\n\
         resources:\n\
           - resources:\n\
               - secrets\n\
             providers:\n\
               - aesgcm:\n\
                   keys:\n\
                     - name: {primary}\n\
                       secret: QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE=\n\
                     - name: {secondary}\n\
                       secret: QkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkI=\n"
    )
}

/// Delegates to the local in-process service but answers health checks from
/// a switch, so tests can build configurations that fail the reload gate.
struct SwitchableKmsFactory {
    service: Arc<LocalEnvelopeService>,
    healthy: Arc<AtomicBool>,
}

struct SwitchableService {
    inner: Arc<LocalEnvelopeService>,
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl KmsService for SwitchableService {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        KmsService::encrypt(self.inner.as_ref(), plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        KmsService::decrypt(self.inner.as_ref(), ciphertext).await
    }

    async fn health(&self) -> Result<(), KmsError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KmsError::Unavailable("plugin down".to_string()))
        }
    }
}

#[async_trait]
impl EnvelopeServiceFactory for SwitchableKmsFactory {
    async fn create_v1(
        &self,
        _endpoint: &str,
        _lifecycle: &CancellationToken,
    ) -> Result<Arc<dyn KmsService>, KmsError> {
        Ok(Arc::new(SwitchableService {
            inner: self.service.clone(),
            healthy: self.healthy.clone(),
        }))
    }

    async fn create_v2(
        &self,
        _endpoint: &str,
        _lifecycle: &CancellationToken,
    ) -> Result<Arc<dyn KmsServiceV2>, KmsError> {
        Ok(self.service.clone())
    }
}

fn write_config(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
}

async fn start_holder(
    path: &Path,
    factory: &dyn EnvelopeServiceFactory,
    shutdown: &CancellationToken,
) -> (Arc<DynamicTransformers>, String) {
    let config = load_encryption_configuration(path, factory, shutdown)
        .await
        .unwrap();
    let hash = config.content_hash.clone();
    let lifecycle = shutdown.child_token();
    let holder = DynamicTransformers::new(
        TransformerGeneration::new(
            config.transformers,
            config.health_checks[0].clone(),
            Box::new(move || lifecycle.cancel()),
            config.kms_close_grace_period,
        ),
        shutdown.clone(),
    );
    (holder, hash)
}

async fn encode_key_name(holder: &DynamicTransformers) -> String {
    let stored = holder
        .current()
        .transformers()
        .get(&GroupResource::new("", "secrets"))
        .unwrap()
        .transform_to_storage(b"value", b"ctx")
        .await
        .unwrap();
    String::from_utf8_lossy(&stored)
        .split(':')
        .nth(4)
        .unwrap()
        .to_string()
}

async fn wait_for_key_name(holder: &DynamicTransformers, expected: &str) {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if encode_key_name(holder).await == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("holder never published a generation writing with {expected}"));
}

fn temp_config(body: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("encryption.yaml");
    write_config(&path, body);
    (dir, path)
}

fn local_factory() -> Arc<SwitchableKmsFactory> {
    Arc::new(SwitchableKmsFactory {
        service: Arc::new(LocalEnvelopeService::new(&[11u8; 32], "key-1")),
        healthy: Arc::new(AtomicBool::new(true)),
    })
}

#[tokio::test(start_paused = true)]
async fn file_change_publishes_a_new_generation() {
    let (_dir, path) = temp_config(&config_body("key1", "key2"));
    let factory = local_factory();
    let shutdown = CancellationToken::new();

    let (holder, initial_hash) = start_holder(&path, factory.as_ref(), &shutdown).await;
    assert_eq!(encode_key_name(&holder).await, "key1");

    let controller = ReloadController::new(
        "encryption-config",
        &path,
        holder.clone(),
        initial_hash,
        "server-a",
        factory.clone(),
    )
    .with_poll_period(POLL);
    let worker = tokio::spawn(controller.run(shutdown.clone()));

    // Rotate the primary key on disk; the old generation keeps serving
    // reads written before the swap.
    let old_generation = holder.current();
    write_config(&path, &config_body("key2", "key1"));
    wait_for_key_name(&holder, "key2").await;

    let stored_old = old_generation
        .transformers()
        .get(&GroupResource::new("", "secrets"))
        .unwrap()
        .transform_to_storage(b"value", b"ctx")
        .await
        .unwrap();
    let (plaintext, stale) = holder
        .current()
        .transformers()
        .get(&GroupResource::new("", "secrets"))
        .unwrap()
        .transform_from_storage(&stored_old, b"ctx")
        .await
        .unwrap();
    assert_eq!(plaintext, b"value");
    assert!(stale, "data written by the replaced primary reads as stale");

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unchanged_content_is_not_reapplied() {
    let (_dir, path) = temp_config(&config_body("key1", "key2"));
    let factory = local_factory();
    let shutdown = CancellationToken::new();

    let (holder, initial_hash) = start_holder(&path, factory.as_ref(), &shutdown).await;
    let controller = ReloadController::new(
        "encryption-config",
        &path,
        holder.clone(),
        initial_hash,
        "server-a",
        factory.clone(),
    )
    .with_poll_period(POLL);
    let worker = tokio::spawn(controller.run(shutdown.clone()));

    let before = holder.current();
    // Rewrite identical bytes; only the mtime changes, not the hash.
    write_config(&path, &config_body("key1", "key2"));
    tokio::time::sleep(POLL * 10).await;

    assert!(Arc::ptr_eq(&before, &holder.current()));

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn broken_file_keeps_the_working_generation() {
    let (_dir, path) = temp_config(&config_body("key1", "key2"));
    let factory = local_factory();
    let shutdown = CancellationToken::new();

    let (holder, initial_hash) = start_holder(&path, factory.as_ref(), &shutdown).await;
    let controller = ReloadController::new(
        "encryption-config",
        &path,
        holder.clone(),
        initial_hash,
        "server-a",
        factory.clone(),
    )
    .with_poll_period(POLL);
    let worker = tokio::spawn(controller.run(shutdown.clone()));

    write_config(&path, "kind: EncryptionConfiguration\nresources: {{{");
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(encode_key_name(&holder).await, "key1");

    // A later fix is picked up despite the accumulated backoff.
    write_config(&path, &config_body("key2", "key1"));
    wait_for_key_name(&holder, "key2").await;

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unhealthy_kms_blocks_publication_until_it_recovers() {
    let kms_rule = "apiVersion: apiserver.config.k8s.io/v1\n\
         kind: EncryptionConfiguration\n\
         resources:\n\
           - resources:\n\
               - secrets\n\
             providers:\n\
               - kms:\n\
                   apiVersion: v1\n\
                   name: sandbox\n\
                   endpoint: unix:///tmp/kms.sock\n\
                   timeout: 1s\n\
               - aesgcm:\n\
                   keys:\n\
                     - name: key1\n\
                       secret: QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE=\n";

    let (_dir, path) = temp_config(&config_body("key1", "key2"));
    let factory = local_factory();
    let shutdown = CancellationToken::new();

    let (holder, initial_hash) = start_holder(&path, factory.as_ref(), &shutdown).await;
    let controller = ReloadController::new(
        "encryption-config",
        &path,
        holder.clone(),
        initial_hash,
        "server-a",
        factory.clone(),
    )
    .with_poll_period(POLL);
    let worker = tokio::spawn(controller.run(shutdown.clone()));

    factory.healthy.store(false, Ordering::SeqCst);
    write_config(&path, kms_rule);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(
        encode_key_name(&holder).await,
        "key1",
        "gate must hold back a configuration whose KMS is down"
    );

    factory.healthy.store(true, Ordering::SeqCst);
    wait_for_key_name(&holder, "sandbox").await;

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn initial_work_item_applies_changes_before_the_first_poll() {
    let (_dir, path) = temp_config(&config_body("key1", "key2"));
    let factory = local_factory();
    let shutdown = CancellationToken::new();

    let (holder, initial_hash) = start_holder(&path, factory.as_ref(), &shutdown).await;
    assert_eq!(encode_key_name(&holder).await, "key1");

    // The file changes after the startup load but before the controller
    // runs; with an hour-long poll period only the construction-time work
    // item can pick it up.
    write_config(&path, &config_body("key2", "key1"));

    let controller = ReloadController::new(
        "encryption-config",
        &path,
        holder.clone(),
        initial_hash,
        "server-a",
        factory.clone(),
    )
    .with_poll_period(Duration::from_secs(3600));
    let worker = tokio::spawn(controller.run(shutdown.clone()));

    wait_for_key_name(&holder, "key2").await;

    shutdown.cancel();
    worker.await.unwrap();
}
