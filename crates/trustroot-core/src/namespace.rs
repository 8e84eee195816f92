use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use trustroot_protocol::{DEVICE_POLICY_TYPE, EXTENSION_POLICY_TYPE, SIGNIN_EXTENSION_POLICY_TYPE};

use crate::error::{PolicyError, PolicyResult};

const MAX_COMPONENT_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyDomain {
    /// Device-wide domain; the only one without a component id.
    Chrome,
    Extensions,
    SigninExtensions,
}

impl PolicyDomain {
    pub const ALL: [PolicyDomain; 3] = [Self::Chrome, Self::Extensions, Self::SigninExtensions];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chrome => "device",
            Self::Extensions => "extension",
            Self::SigninExtensions => "signin-extension",
        }
    }

    /// The only `policy_type` a payload stored in this domain may carry.
    pub const fn accepted_policy_type(self) -> &'static str {
        match self {
            Self::Chrome => DEVICE_POLICY_TYPE,
            Self::Extensions => EXTENSION_POLICY_TYPE,
            Self::SigninExtensions => SIGNIN_EXTENSION_POLICY_TYPE,
        }
    }

    fn file_infix(self) -> &'static str {
        match self {
            Self::Chrome => "",
            Self::Extensions => "extension_id_",
            Self::SigninExtensions => "signin_extension_id_",
        }
    }
}

impl FromStr for PolicyDomain {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|domain| domain.as_str() == s)
            .ok_or_else(|| PolicyError::InvalidNamespace(format!("unknown domain {s:?}")))
    }
}

/// Isolation unit for policy. Maps 1:1 to a backing file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyNamespace {
    domain: PolicyDomain,
    component_id: String,
}

impl PolicyNamespace {
    pub fn device() -> Self {
        Self {
            domain: PolicyDomain::Chrome,
            component_id: String::new(),
        }
    }

    pub fn new(domain: PolicyDomain, component_id: impl Into<String>) -> PolicyResult<Self> {
        let component_id = component_id.into();
        match domain {
            PolicyDomain::Chrome if component_id.is_empty() => {}
            PolicyDomain::Chrome => {
                return Err(PolicyError::InvalidNamespace(
                    "device domain takes no component id".to_string(),
                ))
            }
            _ => validate_component_id(&component_id)?,
        }
        Ok(Self {
            domain,
            component_id,
        })
    }

    pub fn domain(&self) -> PolicyDomain {
        self.domain
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn is_device(&self) -> bool {
        self.domain == PolicyDomain::Chrome
    }

    pub fn file_name(&self, device_file: &str, component_prefix: &str) -> String {
        if self.is_device() {
            device_file.to_string()
        } else {
            format!(
                "{component_prefix}{}{}",
                self.domain.file_infix(),
                self.component_id
            )
        }
    }

    pub fn file_path(&self, state_dir: &Path, device_file: &str, component_prefix: &str) -> PathBuf {
        state_dir.join(self.file_name(device_file, component_prefix))
    }

    /// Recovers the component id from a stored file name, if the name
    /// belongs to `domain`.
    pub fn component_from_file_name(
        domain: PolicyDomain,
        file_name: &str,
        component_prefix: &str,
    ) -> Option<String> {
        if domain == PolicyDomain::Chrome {
            return None;
        }
        let id = file_name
            .strip_prefix(component_prefix)?
            .strip_prefix(domain.file_infix())?;
        validate_component_id(id).ok().map(|()| id.to_string())
    }
}

fn validate_component_id(id: &str) -> PolicyResult<()> {
    if id.is_empty() || id.len() > MAX_COMPONENT_ID_LEN {
        return Err(PolicyError::InvalidNamespace(format!(
            "component id must be 1..={MAX_COMPONENT_ID_LEN} characters"
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(PolicyError::InvalidNamespace(format!(
            "component id {id:?} contains forbidden characters"
        )));
    }
    Ok(())
}

impl fmt::Display for PolicyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_device() {
            f.write_str(self.domain.as_str())
        } else {
            write!(f, "{}:{}", self.domain.as_str(), self.component_id)
        }
    }
}

impl FromStr for PolicyNamespace {
    type Err = PolicyError;

    /// Parses `device`, `extension:<id>` or `signin-extension:<id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None => {
                let domain: PolicyDomain = s.parse()?;
                Self::new(domain, "")
            }
            Some((domain, id)) => Self::new(domain.parse()?, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_namespace_uses_fixed_file() {
        let ns = PolicyNamespace::device();
        assert_eq!(ns.file_name("policy", "policy_"), "policy");
        assert_eq!(ns.to_string(), "device");
    }

    #[test]
    fn component_namespaces_get_distinct_files() {
        let ext = PolicyNamespace::new(PolicyDomain::Extensions, "abc").expect("ns");
        let signin = PolicyNamespace::new(PolicyDomain::SigninExtensions, "abc").expect("ns");
        assert_eq!(ext.file_name("policy", "policy_"), "policy_extension_id_abc");
        assert_eq!(
            signin.file_name("policy", "policy_"),
            "policy_signin_extension_id_abc"
        );
    }

    #[test]
    fn path_traversal_rejected() {
        for bad in ["", "../owner.key", "a/b", "a.b", &"x".repeat(65)] {
            assert!(PolicyNamespace::new(PolicyDomain::Extensions, bad).is_err(), "{bad}");
        }
        assert!(PolicyNamespace::new(PolicyDomain::Chrome, "abc").is_err());
    }

    #[test]
    fn parses_cli_form() {
        assert_eq!("device".parse::<PolicyNamespace>().expect("ns"), PolicyNamespace::device());
        let ns: PolicyNamespace = "signin-extension:abc".parse().expect("ns");
        assert_eq!(ns.domain(), PolicyDomain::SigninExtensions);
        assert_eq!(ns.to_string(), "signin-extension:abc");
        assert!("extension".parse::<PolicyNamespace>().is_err());
    }

    #[test]
    fn component_recovered_only_for_matching_domain() {
        let name = "policy_signin_extension_id_abc";
        assert_eq!(
            PolicyNamespace::component_from_file_name(PolicyDomain::SigninExtensions, name, "policy_"),
            Some("abc".to_string())
        );
        assert_eq!(
            PolicyNamespace::component_from_file_name(PolicyDomain::Extensions, name, "policy_"),
            None
        );
        assert_eq!(
            PolicyNamespace::component_from_file_name(PolicyDomain::Extensions, "policy_extension_id_x.tmp", "policy_"),
            None
        );
    }
}
