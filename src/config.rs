use std::time::Duration;

use crate::backoff::BackoffStrategy;
use crate::retry::{RetryBudget, RetryPolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    HighThroughput,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub request_timeout: Duration,
    pub total_timeout: Option<Duration>,
    pub retry_budget: RetryBudget,
    pub retry_policy: RetryPolicy,
    pub backoff: Option<BackoffStrategy>,
    pub max_response_body_bytes: usize,
    pub connect_timeout: Duration,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::StandardSdk => ProfileDefaults {
                request_timeout: Duration::from_secs(10),
                total_timeout: None,
                retry_budget: RetryBudget::none(),
                retry_policy: RetryPolicy::standard(),
                backoff: None,
                max_response_body_bytes: 8 * 1024 * 1024,
                connect_timeout: Duration::from_secs(5),
            },
            Self::LowLatency => ProfileDefaults {
                request_timeout: Duration::from_secs(2),
                total_timeout: Some(Duration::from_secs(5)),
                retry_budget: RetryBudget::new(1),
                retry_policy: RetryPolicy::standard(),
                backoff: Some(BackoffStrategy::full_jitter(
                    Duration::from_millis(50),
                    Duration::from_millis(300),
                )),
                max_response_body_bytes: 2 * 1024 * 1024,
                connect_timeout: Duration::from_secs(1),
            },
            Self::HighThroughput => ProfileDefaults {
                request_timeout: Duration::from_secs(20),
                total_timeout: Some(Duration::from_secs(60)),
                retry_budget: RetryBudget::new(3),
                retry_policy: RetryPolicy::standard(),
                backoff: Some(BackoffStrategy::equal_jitter(
                    Duration::from_millis(150),
                    Duration::from_secs(3),
                )),
                max_response_body_bytes: 32 * 1024 * 1024,
                connect_timeout: Duration::from_secs(5),
            },
        }
    }
}
