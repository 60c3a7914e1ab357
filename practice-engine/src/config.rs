use std::str::FromStr;
use std::time::Duration;

use practice_utils::SessionKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How a closed session decides `passed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassRule {
    /// At least this many correct answers, whatever the session size.
    MinCorrect(u32),
    /// At least this percentage of the session's questions, rounded up.
    Percent(u32),
}

impl PassRule {
    pub fn passed(&self, correct: u32, total: u32) -> bool {
        match *self {
            PassRule::MinCorrect(min) => correct >= min,
            PassRule::Percent(percent) => {
                let required = (u64::from(total) * u64::from(percent)).div_ceil(100);
                total > 0 && u64::from(correct) >= required
            }
        }
    }
}

impl FromStr for PassRule {
    type Err = String;

    /// `min:4` or `percent:80`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| "expected `min:<n>` or `percent:<n>`".to_string())?;
        let value: u32 = value.trim().parse().map_err(|e| format!("{e}"))?;
        match kind.trim() {
            "min" => Ok(PassRule::MinCorrect(value)),
            "percent" if value <= 100 => Ok(PassRule::Percent(value)),
            "percent" => Err("percent must be at most 100".to_string()),
            other => Err(format!("unknown pass rule kind {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassPolicy {
    pub practice_stop: PassRule,
    pub simulation: PassRule,
    pub diagnostic: PassRule,
    pub challenge: PassRule,
}

impl PassPolicy {
    pub fn rule_for(&self, kind: SessionKind) -> PassRule {
        match kind {
            SessionKind::PracticeStop => self.practice_stop,
            SessionKind::Simulation => self.simulation,
            SessionKind::Diagnostic => self.diagnostic,
            SessionKind::Challenge => self.challenge,
        }
    }
}

impl Default for PassPolicy {
    fn default() -> Self {
        // 4 of 5 for short units; 80% (the same ratio) for the larger ones.
        Self {
            practice_stop: PassRule::MinCorrect(4),
            simulation: PassRule::Percent(80),
            diagnostic: PassRule::Percent(80),
            challenge: PassRule::MinCorrect(4),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub stop_size: usize,
    pub simulation_size: usize,
    pub diagnostic_per_area: usize,
    pub challenge_size: usize,
    /// Assigned to questions that carry no limit of their own.
    pub default_time_limit_secs: u32,
    pub supplier_timeout: Duration,
    /// Tries per progress upsert before giving up with a write conflict.
    pub write_attempts: u32,
    pub busy_timeout: Duration,
    pub pass_policy: PassPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_size: 5,
            simulation_size: 25,
            diagnostic_per_area: 5,
            challenge_size: 5,
            default_time_limit_secs: 60,
            supplier_timeout: Duration::from_secs(20),
            write_attempts: 3,
            busy_timeout: Duration::from_secs(5),
            pass_policy: PassPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `PRACTICE_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let pass_policy = PassPolicy {
            practice_stop: env_or("PRACTICE_PASS_STOP", defaults.pass_policy.practice_stop)?,
            simulation: env_or("PRACTICE_PASS_SIMULATION", defaults.pass_policy.simulation)?,
            diagnostic: env_or("PRACTICE_PASS_DIAGNOSTIC", defaults.pass_policy.diagnostic)?,
            challenge: env_or("PRACTICE_PASS_CHALLENGE", defaults.pass_policy.challenge)?,
        };

        let write_attempts: u32 = env_or("PRACTICE_WRITE_ATTEMPTS", defaults.write_attempts)?;
        if write_attempts < 2 {
            return Err(ConfigError::Invalid {
                name: "PRACTICE_WRITE_ATTEMPTS",
                value: write_attempts.to_string(),
                reason: "a lost race must be retried at least once".to_string(),
            });
        }

        Ok(Self {
            default_time_limit_secs: env_or(
                "PRACTICE_DEFAULT_TIME_LIMIT_SECS",
                defaults.default_time_limit_secs,
            )?,
            supplier_timeout: Duration::from_secs(env_or(
                "PRACTICE_SUPPLIER_TIMEOUT_SECS",
                defaults.supplier_timeout.as_secs(),
            )?),
            write_attempts,
            pass_policy,
            ..defaults
        })
    }
}

fn env_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_correct_ignores_total() {
        let rule = PassRule::MinCorrect(4);
        assert!(rule.passed(4, 5));
        assert!(!rule.passed(3, 5));
        assert!(rule.passed(4, 25));
    }

    #[test]
    fn test_percent_rounds_up() {
        let rule = PassRule::Percent(80);
        assert!(rule.passed(4, 5));
        assert!(!rule.passed(3, 5));
        assert!(rule.passed(20, 25));
        assert!(!rule.passed(19, 25));
        // 80% of 7 is 5.6, so 6 are needed
        assert!(!rule.passed(5, 7));
        assert!(rule.passed(6, 7));
        assert!(!rule.passed(0, 0));
    }

    #[test]
    fn test_pass_rule_parse() {
        assert_eq!("min:4".parse::<PassRule>(), Ok(PassRule::MinCorrect(4)));
        assert_eq!("percent: 75".parse::<PassRule>(), Ok(PassRule::Percent(75)));
        assert!("percent:120".parse::<PassRule>().is_err());
        assert!("ratio:3".parse::<PassRule>().is_err());
        assert!("4".parse::<PassRule>().is_err());
    }
}
