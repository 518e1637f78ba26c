use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::client::PurchasesOptions;
use crate::error::{PurchasesError, Result};
use crate::storage::KeyValueStore;
use crate::verification::{Ed25519SignatureVerifier, ResponseVerifier, VerificationMode};

pub const DEFAULT_BASE_URL: &str = "https://api.revenuecat.com";

/// Which [`VerificationMode`] to build, before a public key is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationSetting {
    #[default]
    Disabled,
    Informational,
    Enforced,
}

impl FromStr for VerificationSetting {
    type Err = PurchasesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disabled" => Ok(Self::Disabled),
            "informational" => Ok(Self::Informational),
            "enforced" => Ok(Self::Enforced),
            other => Err(PurchasesError::configuration(format!(
                "unknown verification mode '{}', expected disabled, informational or enforced",
                other
            ))),
        }
    }
}

impl VerificationSetting {
    /// Attach the server's public key. Required unless disabled.
    pub fn into_mode(self, public_key: Option<&str>) -> Result<VerificationMode> {
        if self == Self::Disabled {
            return Ok(VerificationMode::Disabled);
        }
        let public_key = public_key.ok_or_else(|| {
            PurchasesError::configuration("verification is enabled but no public key is set")
        })?;
        let verifier = Ed25519SignatureVerifier::from_base64(public_key)
            .map_err(|e| PurchasesError::configuration(format!("invalid public key: {}", e)))?;
        let verifier = Arc::new(ResponseVerifier::new(Arc::new(verifier)));

        Ok(match self {
            Self::Informational => VerificationMode::Informational(verifier),
            _ => VerificationMode::Enforced(verifier),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub verification: VerificationSetting,
    pub public_key: Option<String>,
    pub storage_dir: Option<PathBuf>,
    pub app_user_id: Option<String>,
}

impl Config {
    /// Read `PURCHASES_*` variables, loading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let base_url = non_empty("PURCHASES_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let verification = non_empty("PURCHASES_VERIFICATION")
            .map(|v| v.parse::<VerificationSetting>())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            api_key: non_empty("PURCHASES_API_KEY").unwrap_or_default(),
            base_url: validate_base_url(&base_url)?,
            verification,
            public_key: non_empty("PURCHASES_PUBLIC_KEY"),
            storage_dir: non_empty("PURCHASES_STORAGE_DIR").map(PathBuf::from),
            app_user_id: non_empty("PURCHASES_APP_USER_ID"),
        })
    }

    /// Options for [`crate::Purchases::new`]. Opens file storage when a
    /// storage directory is configured.
    pub fn into_options(self) -> Result<PurchasesOptions> {
        let verification = self.verification.into_mode(self.public_key.as_deref())?;
        let storage = match &self.storage_dir {
            Some(dir) => Some(open_storage(dir)?),
            None => None,
        };

        Ok(PurchasesOptions {
            base_url: Some(self.base_url),
            storage,
            app_user_id: self.app_user_id,
            verification: Some(verification),
            backend: None,
        })
    }
}

/// Parse and normalize a server base URL, without a trailing slash.
pub fn validate_base_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())
        .map_err(|e| PurchasesError::configuration(format!("invalid base url '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PurchasesError::configuration(format!(
            "base url must be http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(feature = "file-storage")]
fn open_storage(dir: &std::path::Path) -> Result<Arc<dyn KeyValueStore>> {
    Ok(Arc::new(crate::storage::FileStorage::open(dir)?))
}

#[cfg(not(feature = "file-storage"))]
fn open_storage(dir: &std::path::Path) -> Result<Arc<dyn KeyValueStore>> {
    Err(PurchasesError::configuration(format!(
        "storage directory {} set but file storage is not enabled",
        dir.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("PURCHASES_API_KEY", "appl_123")])).unwrap();
        assert_eq!(config.api_key, "appl_123");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.verification, VerificationSetting::Disabled);
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let vars = [("PURCHASES_BASE_URL", "http://127.0.0.1:8080/")];
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:8080");
        assert!(validate_base_url("ftp://example.com").is_err());
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn test_verification_setting_parsing() {
        assert_eq!(
            "Enforced".parse::<VerificationSetting>().unwrap(),
            VerificationSetting::Enforced
        );
        assert!("strict".parse::<VerificationSetting>().is_err());
    }

    #[test]
    fn test_enabled_verification_requires_key() {
        let err = VerificationSetting::Informational.into_mode(None).unwrap_err();
        assert_eq!(err.code, crate::error::PurchasesErrorCode::Configuration);
        assert!(VerificationSetting::Enforced.into_mode(Some("!!")).is_err());

        let key = ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]);
        let encoded = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(key.verifying_key().as_bytes())
        };
        assert!(VerificationSetting::Enforced
            .into_mode(Some(encoded.as_str()))
            .unwrap()
            .is_enforced());
    }
}
