//! Component A: resolves a tenant VM id to its internal IP address.
//!
//! Grounded on `examples/original_source/proxy.py`'s `check_auth_password`
//! query (`SELECT internal_ip FROM volum_vms WHERE ctid=?`), backed here by
//! `sqlx` instead of `mariadb`/paramiko.

use async_trait::async_trait;
use sqlx::MySqlPool;

/// Abstracts the VM directory lookup so the auth path can be exercised in
/// tests without a real database.
#[async_trait]
pub trait DirectoryResolver: Send + Sync {
    /// Resolves a VM id to its internal IP. `Ok(None)` means the id is
    /// well-formed but no such VM exists; the caller treats that the same
    /// as any other auth failure.
    async fn resolve(&self, vm_id: u64) -> anyhow::Result<Option<String>>;
}

/// `sqlx`-backed resolver against the `volum_vms` table.
pub struct MySqlDirectoryResolver {
    pool: MySqlPool,
}

impl MySqlDirectoryResolver {
    pub fn new(pool: MySqlPool) -> Self {
        MySqlDirectoryResolver { pool }
    }
}

#[async_trait]
impl DirectoryResolver for MySqlDirectoryResolver {
    async fn resolve(&self, vm_id: u64) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT internal_ip FROM volum_vms WHERE ctid = ?")
                .bind(vm_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(ip,)| ip))
    }
}

/// In-memory stand-in used by integration tests so the auth path can be
/// exercised without a real database. Not compiled into release builds.
#[cfg(any(test, feature = "test_hooks"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct FakeDirectoryResolver {
        vms: Mutex<HashMap<u64, String>>,
    }

    impl FakeDirectoryResolver {
        pub fn new(vms: HashMap<u64, String>) -> Self {
            FakeDirectoryResolver { vms: Mutex::new(vms) }
        }
    }

    #[async_trait]
    impl DirectoryResolver for FakeDirectoryResolver {
        async fn resolve(&self, vm_id: u64) -> anyhow::Result<Option<String>> {
            Ok(self.vms.lock().unwrap().get(&vm_id).cloned())
        }
    }
}
