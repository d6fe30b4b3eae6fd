use std::{env, fmt, str::FromStr};

use anyhow::Context;
use serde::Serialize;
use serde_with::DeserializeFromStr;

use crate::Apply;

/// Represents a validated `DEPLOY_ENVIRONMENT` configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[derive(Serialize, DeserializeFromStr)]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum DeployEnv {
    /// "test": in-process tests and CI. Webhooks are processed inline and
    /// scheduled jobs skip their Redis leases.
    Test,
    /// "dev"
    Dev,
    /// "staging"
    Staging,
    /// "prod"
    Prod,
}

impl DeployEnv {
    /// Read a [`DeployEnv`] from env, or err if it was invalid / didn't exist.
    pub fn from_env() -> anyhow::Result<Self> {
        env::var("DEPLOY_ENVIRONMENT")
            .context("DEPLOY_ENVIRONMENT was not set")?
            .as_str()
            .apply(Self::from_str)
    }

    /// Get a [`str`] containing "test", "dev", "staging", or "prod".
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }

    /// Shorthand to check whether this [`DeployEnv`] is test.
    #[inline]
    pub fn is_test(self) -> bool {
        matches!(self, Self::Test)
    }

    /// Shorthand to check whether this [`DeployEnv`] is staging or prod.
    #[inline]
    pub fn is_staging_or_prod(self) -> bool {
        matches!(self, Self::Staging | Self::Prod)
    }

    /// Whether webhook events should be processed inline in the request
    /// handler instead of being handed to the async worker pool.
    #[inline]
    pub fn webhooks_inline(self) -> bool {
        self.is_test()
    }

    /// Whether scheduled jobs must acquire a distributed lease before
    /// running. Disabled under `test` so paused-clock tests don't need Redis.
    #[inline]
    pub fn job_leases_enabled(self) -> bool {
        !self.is_test()
    }
}

impl FromStr for DeployEnv {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "test" => Ok(Self::Test),
            "dev" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" => Ok(Self::Prod),
            _ => Err(anyhow::anyhow!(
                "DEPLOY_ENVIRONMENT must be test|dev|staging|prod"
            )),
        }
    }
}

impl fmt::Display for DeployEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_all_variants() {
        for s in ["test", "dev", "staging", "prod"] {
            let env = DeployEnv::from_str(s).unwrap();
            assert_eq!(env.as_str(), s);
        }
        assert!(DeployEnv::from_str("production").is_err());
    }

    #[test]
    fn test_env_behavior_flags() {
        assert!(DeployEnv::Test.webhooks_inline());
        assert!(!DeployEnv::Prod.webhooks_inline());
        assert!(!DeployEnv::Test.job_leases_enabled());
        assert!(DeployEnv::Staging.job_leases_enabled());
    }
}
