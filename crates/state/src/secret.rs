use uuid::Uuid;

/// The HMAC signing key for exported state. Missing configuration falls
/// back to an ephemeral, process-local random key —
/// every previously signed state then fails `verify` after a restart.
pub struct StateSecret {
    key: Vec<u8>,
    pub ephemeral: bool,
}

impl StateSecret {
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(v) if !v.is_empty() => Self {
                key: v.into_bytes(),
                ephemeral: false,
            },
            _ => {
                tracing::warn!(
                    env_var = var,
                    "state signing secret not configured; using an ephemeral random key \
                    (previously signed state will fail to restore after a restart)"
                );
                Self::ephemeral()
            }
        }
    }

    pub fn ephemeral() -> Self {
        // uuid v4 draws from the OS CSPRNG; two draws give 256 bits,
        // avoiding a dedicated `rand` dependency for one-shot key material.
        let mut key = vec![0u8; 32];
        key[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        key[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self {
            key,
            ephemeral: true,
        }
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }
}
