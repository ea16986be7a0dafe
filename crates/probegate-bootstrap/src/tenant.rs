//! Tenant identity read from the boot media
//!
//! The ISO builder drops a `probe_config.txt` with `KEY=value` lines onto
//! the boot partition. Several locations are searched because different
//! images mount the boot media in different places.

use probegate_proto::slugify;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::BootstrapError;

/// Default search order for `probe_config.txt`
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/boot/probe_config.txt",
    "/run/live/medium/probe_config.txt",
    "/boot/firmware/probe_config.txt",
    "/mnt/probe_config.txt",
];

/// Which tenant and site this probe belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantIdentity {
    pub tenant: String,
    pub tenant_slug: String,
    pub site: String,
    pub site_slug: String,
}

impl TenantIdentity {
    /// Parse one config file; `None` if it names no tenant.
    ///
    /// Slugs are derived from names when missing and the site defaults to
    /// the tenant. A file carrying only `TENANT_SLUG` is still accepted.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut tenant_name = None;
        let mut tenant_slug = None;
        let mut site_name = None;
        let mut site_slug = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if value.is_empty() {
                continue;
            }

            match key.trim() {
                "TENANT_NAME" => tenant_name = Some(value.to_string()),
                "TENANT_SLUG" => tenant_slug = Some(value.to_string()),
                "SITE_NAME" => site_name = Some(value.to_string()),
                "SITE_SLUG" => site_slug = Some(value.to_string()),
                _ => {}
            }
        }

        if let Some(tenant) = tenant_name {
            let tenant_slug = tenant_slug.unwrap_or_else(|| slugify(&tenant));
            let site_slug = match (&site_slug, &site_name) {
                (Some(slug), _) => slug.clone(),
                (None, Some(name)) => slugify(name),
                (None, None) => tenant_slug.clone(),
            };
            let site = site_name.unwrap_or_else(|| tenant.clone());
            return Some(Self {
                tenant,
                tenant_slug,
                site,
                site_slug,
            });
        }

        // Older images only carried slugs
        let tenant_slug = tenant_slug?;
        let site_slug = site_slug.unwrap_or_else(|| tenant_slug.clone());
        Some(Self {
            tenant: title_case(&tenant_slug),
            site: title_case(&site_slug),
            tenant_slug,
            site_slug,
        })
    }

    /// First config file among `paths` that names a tenant
    pub fn load(paths: &[PathBuf]) -> Result<Self, BootstrapError> {
        for path in paths {
            match read_if_present(path) {
                Ok(Some(contents)) => {
                    debug!(path = %path.display(), "Checking tenant config");
                    if let Some(identity) = Self::parse(&contents) {
                        info!(
                            path = %path.display(),
                            tenant = %identity.tenant,
                            tenant_slug = %identity.tenant_slug,
                            site = %identity.site,
                            site_slug = %identity.site_slug,
                            "Loaded tenant config"
                        );
                        return Ok(identity);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "Error reading tenant config: {}", e),
            }
        }

        let searched: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        Err(BootstrapError::Fatal(format!(
            "Tenant configuration not found in any of: {}",
            searched.join(", ")
        )))
    }
}

fn read_if_present(path: &Path) -> std::io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// `acme_corp` -> `Acme_Corp`
fn title_case(slug: &str) -> String {
    let mut out = String::with_capacity(slug.len());
    let mut start = true;
    for c in slug.chars() {
        if c.is_alphanumeric() {
            if start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            start = false;
        } else {
            out.push(c);
            start = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_names_derive_slugs_and_site_defaults_to_tenant() {
        let identity = TenantIdentity::parse("# probe config\nTENANT_NAME=\"Acme Corp\"\n").unwrap();
        assert_eq!(identity.tenant, "Acme Corp");
        assert_eq!(identity.tenant_slug, "acme_corp");
        assert_eq!(identity.site, "Acme Corp");
        assert_eq!(identity.site_slug, "acme_corp");
    }

    #[test]
    fn test_explicit_values_win() {
        let identity = TenantIdentity::parse(
            "TENANT_NAME=Acme Corp\nTENANT_SLUG=acme\nSITE_NAME='North Plant'\nSITE_SLUG=np\n",
        )
        .unwrap();
        assert_eq!(identity.tenant_slug, "acme");
        assert_eq!(identity.site, "North Plant");
        assert_eq!(identity.site_slug, "np");

        let identity = TenantIdentity::parse("TENANT_NAME=Acme\nSITE_NAME=North Plant\n").unwrap();
        assert_eq!(identity.site_slug, "north_plant");
    }

    #[test]
    fn test_slug_only_config() {
        let identity = TenantIdentity::parse("TENANT_SLUG=acme_corp\n").unwrap();
        assert_eq!(identity.tenant, "Acme_Corp");
        assert_eq!(identity.site_slug, "acme_corp");
    }

    #[test]
    fn test_no_tenant() {
        assert!(TenantIdentity::parse("SITE_NAME=hq\nFOO=bar\n").is_none());
        assert!(TenantIdentity::parse("").is_none());
    }

    #[test]
    fn test_load_searches_in_order() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.txt");
        let empty = temp.path().join("empty.txt");
        let good = temp.path().join("good.txt");
        std::fs::write(&empty, "# nothing here\n").unwrap();
        std::fs::write(&good, "TENANT_NAME=Globex\n").unwrap();

        let identity = TenantIdentity::load(&[missing, empty, good]).unwrap();
        assert_eq!(identity.tenant, "Globex");
    }

    #[test]
    fn test_load_without_config_is_fatal() {
        let temp = TempDir::new().unwrap();
        let err = TenantIdentity::load(&[temp.path().join("none.txt")]).unwrap_err();
        assert!(!err.is_retryable());
    }
}
