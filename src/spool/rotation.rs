//! Rotation Policies
//!
//! Pure decisions over a staging file's observed size and age. Size-based
//! rotation only changes when data is written, so the per-batch check is
//! enough; anything time-based also needs a timer.

use crate::spool::clock::Timestamp;
use crate::spool::config::{ConfigError, RotationStrategy};
use crate::spool::staging_file::{StagingError, StagingFile};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Rotate once `size >= threshold`
    Size { threshold: u64 },
    /// Rotate a non-empty file once `age >= threshold`
    Time { threshold: Duration },
    /// Rotate when either sub-policy would
    Hybrid { size: u64, time: Duration },
}

impl RotationPolicy {
    pub fn size(threshold: u64) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::Invalid(
                "size_rotate must be positive for size based rotation".to_string(),
            ));
        }
        Ok(RotationPolicy::Size { threshold })
    }

    pub fn time(threshold: Duration) -> Result<Self, ConfigError> {
        if threshold.is_zero() {
            return Err(ConfigError::Invalid(
                "time_rotate must be positive for time based rotation".to_string(),
            ));
        }
        Ok(RotationPolicy::Time { threshold })
    }

    pub fn hybrid(size: u64, time: Duration) -> Result<Self, ConfigError> {
        Self::size(size)?;
        Self::time(time)?;
        Ok(RotationPolicy::Hybrid { size, time })
    }

    pub fn from_config(
        strategy: RotationStrategy,
        size: u64,
        time: Duration,
    ) -> Result<Self, ConfigError> {
        match strategy {
            RotationStrategy::Size => Self::size(size),
            RotationStrategy::Time => Self::time(time),
            RotationStrategy::SizeAndTime => Self::hybrid(size, time),
        }
    }

    pub fn should_rotate(&self, size: u64, age: Duration) -> bool {
        match *self {
            RotationPolicy::Size { threshold } => size >= threshold,
            RotationPolicy::Time { threshold } => size > 0 && age >= threshold,
            RotationPolicy::Hybrid { size: s, time: t } => {
                RotationPolicy::Size { threshold: s }.should_rotate(size, age)
                    || RotationPolicy::Time { threshold: t }.should_rotate(size, age)
            }
        }
    }

    /// Observe `file` at `now` and decide
    pub fn check(&self, file: &mut StagingFile, now: Timestamp) -> Result<bool, StagingError> {
        let size = file.size()?;
        Ok(self.should_rotate(size, now.saturating_sub(file.created_at())))
    }

    pub fn needs_periodic_check(&self) -> bool {
        !matches!(self, RotationPolicy::Size { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RotationPolicy::Size { .. } => "size",
            RotationPolicy::Time { .. } => "time",
            RotationPolicy::Hybrid { .. } => "size_and_time",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::config::Encoding;
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_size_boundary_is_inclusive() {
        for threshold in [1u64, 7, 1024, 30 * 1024 * 1024] {
            let policy = RotationPolicy::size(threshold).unwrap();
            assert!(!policy.should_rotate(threshold - 1, Duration::ZERO));
            assert!(policy.should_rotate(threshold, Duration::ZERO));
            assert!(policy.should_rotate(threshold + 1, Duration::ZERO));
        }
    }

    #[test]
    fn test_size_scenario_1024() {
        let policy = RotationPolicy::size(1024).unwrap();
        assert!(policy.should_rotate(1025, Duration::ZERO));
        assert!(!policy.should_rotate(1000, Duration::ZERO));
    }

    #[test]
    fn test_time_never_rotates_empty_file() {
        let policy = RotationPolicy::time(MINUTE).unwrap();
        assert!(!policy.should_rotate(0, Duration::from_secs(365 * 24 * 3600)));
        assert!(!policy.should_rotate(10, MINUTE - Duration::from_millis(1)));
        assert!(policy.should_rotate(10, MINUTE));
    }

    #[test]
    fn test_hybrid_is_or_of_both() {
        let hybrid = RotationPolicy::hybrid(100, MINUTE).unwrap();
        let size = RotationPolicy::size(100).unwrap();
        let time = RotationPolicy::time(MINUTE).unwrap();

        for bytes in [0u64, 1, 99, 100, 500] {
            for age in [Duration::ZERO, MINUTE / 2, MINUTE, MINUTE * 2] {
                assert_eq!(
                    hybrid.should_rotate(bytes, age),
                    size.should_rotate(bytes, age) || time.should_rotate(bytes, age),
                    "bytes={} age={:?}",
                    bytes,
                    age
                );
            }
        }
    }

    #[test]
    fn test_periodic_check_requirement() {
        assert!(!RotationPolicy::size(1).unwrap().needs_periodic_check());
        assert!(RotationPolicy::time(MINUTE).unwrap().needs_periodic_check());
        assert!(RotationPolicy::hybrid(1, MINUTE).unwrap().needs_periodic_check());
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        assert!(RotationPolicy::size(0).is_err());
        assert!(RotationPolicy::time(Duration::ZERO).is_err());
        assert!(RotationPolicy::hybrid(0, MINUTE).is_err());
        assert!(RotationPolicy::hybrid(10, Duration::ZERO).is_err());
    }

    #[test]
    fn test_from_config() {
        let policy = RotationPolicy::from_config(RotationStrategy::Size, 10, Duration::ZERO).unwrap();
        assert_eq!(policy, RotationPolicy::Size { threshold: 10 });

        let policy = RotationPolicy::from_config(RotationStrategy::Time, 0, MINUTE).unwrap();
        assert_eq!(policy, RotationPolicy::Time { threshold: MINUTE });

        assert!(RotationPolicy::from_config(RotationStrategy::SizeAndTime, 0, MINUTE).is_err());
    }

    #[test]
    fn test_check_observes_file() {
        let root = TempDir::new().unwrap();
        let created = Timestamp::from_millis(1_000_000);
        let mut file = StagingFile::create(root.path(), "k", 0, Encoding::None, created).unwrap();
        let policy = RotationPolicy::hybrid(1024, MINUTE).unwrap();

        file.write(&[0u8; 1000]).unwrap();
        assert!(!policy.check(&mut file, created).unwrap());
        assert!(policy.check(&mut file, created + MINUTE).unwrap());

        file.write(&[0u8; 25]).unwrap();
        assert!(policy.check(&mut file, created).unwrap());
    }
}
