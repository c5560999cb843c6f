//! C6 Secret Store — spec §4.6.
//!
//! In-memory envelope-encrypted key/value store keyed by `(principal, name)`.
//! Persistence is out of scope (spec Non-goals); this mirrors how
//! `keystore-worker::api` holds its decrypted working set in memory behind a
//! lock while the sealed form stays external to the process.

pub mod audit;
pub mod envelope;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    AuditAction, AuditEntry, DataKeyId, PrincipalId, SecretEntry, SecretExport, SecretMetadata,
};
use audit::AuditLog;
use envelope::DataKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// The data key new `set` calls encrypt under, until it has been in service
/// longer than `rotation_interval` (spec §4.6 "Rotation"). Entries written
/// under a previous current key keep referencing it by id and stay readable
/// — rotation never rewrites existing ciphertext.
struct CurrentKey {
    data_key: DataKey,
    since: Instant,
}

pub struct SecretStore {
    master_key: [u8; envelope::KEY_LEN],
    secrets: Mutex<HashMap<(PrincipalId, String), SecretEntry>>,
    wrapped_data_keys: Mutex<HashMap<DataKeyId, Vec<u8>>>,
    current_key: Mutex<CurrentKey>,
    rotation_interval: Duration,
    audit: AuditLog,
    max_secrets_per_principal: usize,
    max_secret_value_bytes: usize,
}

impl SecretStore {
    pub fn new(config: &EngineConfig) -> Self {
        let master_key = envelope::derive_master_key(&config.master_key_material);
        let data_key = envelope::generate_data_key();
        let wrapped = envelope::wrap_data_key(&master_key, &data_key)
            .expect("wrapping the initial data key under a freshly derived master key cannot fail");

        let mut wrapped_data_keys = HashMap::new();
        wrapped_data_keys.insert(data_key.id.clone(), wrapped);

        Self {
            master_key,
            secrets: Mutex::new(HashMap::new()),
            wrapped_data_keys: Mutex::new(wrapped_data_keys),
            current_key: Mutex::new(CurrentKey {
                data_key,
                since: Instant::now(),
            }),
            rotation_interval: config.secret_key_rotation_interval,
            audit: AuditLog::new(config.audit_log_capacity),
            max_secrets_per_principal: config.max_secrets_per_principal,
            max_secret_value_bytes: config.max_secret_value_bytes,
        }
    }

    /// Return the data key new writes should use, rotating to a fresh one
    /// first if the current key has been in service past the configured
    /// interval. Entries already written under the outgoing key are
    /// unaffected: their `data_key_id` still resolves via
    /// `wrapped_data_keys`.
    fn current_data_key(&self) -> EngineResult<(DataKeyId, [u8; envelope::KEY_LEN])> {
        let mut current = self.current_key.lock().unwrap();
        if current.since.elapsed() >= self.rotation_interval {
            let new_key = envelope::generate_data_key();
            let wrapped = envelope::wrap_data_key(&self.master_key, &new_key)?;
            self.wrapped_data_keys
                .lock()
                .unwrap()
                .insert(new_key.id.clone(), wrapped);
            *current = CurrentKey {
                data_key: new_key,
                since: Instant::now(),
            };
        }
        Ok((current.data_key.id.clone(), current.data_key.key_bytes))
    }

    pub fn set(
        &self,
        principal: &str,
        name: &str,
        value: &str,
        tags: Vec<String>,
    ) -> EngineResult<()> {
        let result = self.set_inner(principal, name, value, tags);
        let created = result.as_ref().map(|is_new| *is_new).unwrap_or(false);
        self.audit.record(AuditEntry {
            at: SystemTime::now(),
            principal: principal.to_string(),
            secret_name: Some(name.to_string()),
            action: if created { AuditAction::Create } else { AuditAction::Update },
            success: result.is_ok(),
        });
        result.map(|_| ())
    }

    /// Returns `Ok(true)` if this created a new entry, `Ok(false)` if it
    /// updated an existing one.
    fn set_inner(&self, principal: &str, name: &str, value: &str, tags: Vec<String>) -> EngineResult<bool> {
        if value.len() > self.max_secret_value_bytes {
            return Err(EngineError::InvalidInput(format!(
                "secret value of {} bytes exceeds max of {}",
                value.len(),
                self.max_secret_value_bytes
            )));
        }

        let key = (principal.to_string(), name.to_string());
        let mut secrets = self.secrets.lock().unwrap();
        let is_new = !secrets.contains_key(&key);

        if is_new {
            let count = secrets.keys().filter(|(p, _)| p == principal).count();
            if count >= self.max_secrets_per_principal {
                return Err(EngineError::PolicyViolation(format!(
                    "principal already holds the maximum of {} secrets",
                    self.max_secrets_per_principal
                )));
            }
        }

        let (data_key_id, data_key_bytes) = self.current_data_key()?;
        let (ciphertext, iv) = envelope::seal(&data_key_bytes, value.as_bytes())?;

        let now = SystemTime::now();
        let version = secrets.get(&key).map(|e| e.metadata.version + 1).unwrap_or(1);
        let created_at = secrets.get(&key).map(|e| e.metadata.created_at).unwrap_or(now);

        secrets.insert(
            key,
            SecretEntry {
                ciphertext,
                iv,
                data_key_id,
                metadata: SecretMetadata {
                    created_at,
                    updated_at: now,
                    last_access: None,
                    version,
                    tags,
                },
            },
        );

        Ok(is_new)
    }

    pub fn get(&self, principal: &str, name: &str) -> EngineResult<String> {
        let result = self.get_inner(principal, name);
        self.record_read_audit(principal, name, result.is_ok());
        result
    }

    /// Append a `read` audit entry without touching the store, for callers
    /// (the `secrets.get` bridge binding) that resolve a value through a
    /// capability check or a transient override and never reach
    /// [`SecretStore::get`] itself — spec §4.4.1 "every call logs an audit
    /// entry" applies regardless of which path resolved the value.
    pub fn record_read_audit(&self, principal: &str, name: &str, success: bool) {
        self.audit.record(AuditEntry {
            at: SystemTime::now(),
            principal: principal.to_string(),
            secret_name: Some(name.to_string()),
            action: AuditAction::Read,
            success,
        });
    }

    fn get_inner(&self, principal: &str, name: &str) -> EngineResult<String> {
        let wrapped = {
            let mut secrets = self.secrets.lock().unwrap();
            let key = (principal.to_string(), name.to_string());
            let entry = secrets
                .get_mut(&key)
                .ok_or_else(|| EngineError::NotFound(format!("no secret named '{name}'")))?;
            entry.metadata.last_access = Some(SystemTime::now());
            (
                entry.data_key_id.clone(),
                entry.ciphertext.clone(),
                entry.iv,
            )
        };
        let (data_key_id, ciphertext, iv) = wrapped;

        let wrapped_key = self
            .wrapped_data_keys
            .lock()
            .unwrap()
            .get(&data_key_id)
            .cloned()
            .ok_or_else(|| EngineError::IntegrityFailure("data key missing for secret".into()))?;

        let data_key = envelope::unwrap_data_key(&self.master_key, &wrapped_key)?;
        let plaintext = envelope::open(&data_key, &ciphertext, &iv)?;

        String::from_utf8(plaintext)
            .map_err(|_| EngineError::IntegrityFailure("decrypted secret is not valid utf-8".into()))
    }

    pub fn delete(&self, principal: &str, name: &str) -> EngineResult<()> {
        let key = (principal.to_string(), name.to_string());
        let removed = {
            let mut secrets = self.secrets.lock().unwrap();
            let removed = secrets.remove(&key);
            if let Some(entry) = &removed {
                self.drop_data_key_if_orphaned(&secrets, &entry.data_key_id);
            }
            removed
        };
        let success = removed.is_some();
        self.audit.record(AuditEntry {
            at: SystemTime::now(),
            principal: principal.to_string(),
            secret_name: Some(name.to_string()),
            action: AuditAction::Delete,
            success,
        });
        if success {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("no secret named '{name}'")))
        }
    }

    /// Remove a wrapped data key once no remaining secret references it and
    /// it is not the store's active current key, spec §4.6: "a key is
    /// retained as long as any secret references it." Several secrets can
    /// share a data key id between rotations, so a single `delete` must not
    /// drop it out from under a sibling secret, nor out from under
    /// `current_data_key`, which would otherwise hand out an id `get` can no
    /// longer resolve.
    fn drop_data_key_if_orphaned(
        &self,
        secrets: &HashMap<(PrincipalId, String), SecretEntry>,
        data_key_id: &DataKeyId,
    ) {
        let still_referenced = secrets.values().any(|e| &e.data_key_id == data_key_id);
        if still_referenced {
            return;
        }
        if self.current_key.lock().unwrap().data_key.id == *data_key_id {
            return;
        }
        self.wrapped_data_keys.lock().unwrap().remove(data_key_id);
    }

    pub fn list(&self, principal: &str) -> Vec<String> {
        self.secrets
            .lock()
            .unwrap()
            .keys()
            .filter(|(p, _)| p == principal)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn get_metadata(&self, principal: &str, name: &str) -> EngineResult<SecretMetadata> {
        let key = (principal.to_string(), name.to_string());
        self.secrets
            .lock()
            .unwrap()
            .get(&key)
            .map(|e| e.metadata.clone())
            .ok_or_else(|| EngineError::NotFound(format!("no secret named '{name}'")))
    }

    pub fn update_tags(&self, principal: &str, name: &str, tags: Vec<String>) -> EngineResult<()> {
        let key = (principal.to_string(), name.to_string());
        let mut secrets = self.secrets.lock().unwrap();
        let entry = secrets
            .get_mut(&key)
            .ok_or_else(|| EngineError::NotFound(format!("no secret named '{name}'")))?;
        entry.metadata.tags = tags;
        entry.metadata.updated_at = SystemTime::now();
        Ok(())
    }

    /// Decrypt every secret a principal owns into an exportable document,
    /// spec §4.6 "export/import". The content hash lets `import_secrets`
    /// detect tampering or accidental truncation of the export document.
    pub fn export_secrets(&self, principal: &str) -> EngineResult<SecretExport> {
        let names = self.list(principal);
        let mut secrets = HashMap::with_capacity(names.len());
        for name in &names {
            let value = self.get_inner(principal, name)?;
            secrets.insert(name.clone(), value);
        }
        let content_hash = hash_secret_map(&secrets);

        self.audit.record(AuditEntry {
            at: SystemTime::now(),
            principal: principal.to_string(),
            secret_name: None,
            action: AuditAction::Export,
            success: true,
        });

        Ok(SecretExport {
            principal: principal.to_string(),
            secrets,
            content_hash,
        })
    }

    /// Import secrets from a document previously produced by
    /// `export_secrets`. Every entry is re-encrypted under `principal`'s
    /// current data key regardless of which principal the document names
    /// (spec §4.6: "always re-encrypted under the importing principal's
    /// current key — they cannot inject ciphertext under another
    /// principal's identity"). Importing `export.principal`'s document
    /// under a different principal is allowed by design (spec §8 scenario
    /// 6) and creates independent copies; it never touches the original
    /// principal's entries.
    pub fn import_secrets(&self, principal: &str, export: &SecretExport) -> EngineResult<usize> {
        if hash_secret_map(&export.secrets) != export.content_hash {
            return Err(EngineError::IntegrityFailure(
                "export document content hash does not match its payload".into(),
            ));
        }

        let mut imported = 0;
        for (name, value) in &export.secrets {
            self.set(principal, name, value, vec![])?;
            imported += 1;
        }

        self.audit.record(AuditEntry {
            at: SystemTime::now(),
            principal: principal.to_string(),
            secret_name: None,
            action: AuditAction::Import,
            success: true,
        });

        Ok(imported)
    }

    pub fn audit_log(&self, principal: &str) -> Vec<AuditEntry> {
        self.audit.snapshot_for(principal)
    }
}

fn hash_secret_map(secrets: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = secrets.keys().collect();
    keys.sort();
    let mut hasher = Sha256::new();
    for k in keys {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
        hasher.update(secrets[k].as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
