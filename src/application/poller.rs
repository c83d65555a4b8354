//! Payment status polling shared by every flow that hands control to an
//! external application.

use crate::domain::payment::{PaymentId, ResponseStatus};
use crate::domain::ports::AcquiringApiRef;
use crate::error::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Bounded retry count and delay between status requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingBudget {
    pub retries: u32,
    #[serde(rename = "delay_ms", with = "millis")]
    pub delay: Duration,
}

impl PollingBudget {
    pub const fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub fn with_retries(self, retries: u32) -> Self {
        Self { retries, ..self }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(delay.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// How a polling run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    Success(ResponseStatus),
    Rejected(ResponseStatus),
    /// Server reported `DEADLINE_EXPIRED` or the budget ran out.
    TimedOut { last_status: Option<ResponseStatus> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// Non-terminal status; polling continues after the delay.
    Checking(ResponseStatus),
    /// Last item of the stream.
    Finished(PollVerdict),
}

/// Repeatedly queries payment status until a terminal answer or until the
/// budget is spent.
#[derive(Clone)]
pub struct StatusPoller {
    api: AcquiringApiRef,
}

impl StatusPoller {
    pub fn new(api: AcquiringApiRef) -> Self {
        Self { api }
    }

    /// Lazy, finite stream of poll events.
    ///
    /// Ends with exactly one `Finished` item, or with an `Err` item when a
    /// status request fails.
    pub fn poll(
        &self,
        payment_id: PaymentId,
        budget: PollingBudget,
    ) -> impl Stream<Item = Result<PollEvent>> + Send + 'static {
        let api = self.api.clone();
        async_stream::try_stream! {
            let mut last_status = None;
            for attempt in 1..=budget.retries {
                let status = api.get_status(payment_id).await?;
                debug!(payment_id = %payment_id, attempt, status = %status, "Polled payment status");

                match status {
                    ResponseStatus::Authorized | ResponseStatus::Confirmed => {
                        info!(payment_id = %payment_id, status = %status, "Payment completed");
                        yield PollEvent::Finished(PollVerdict::Success(status));
                        return;
                    }
                    ResponseStatus::Rejected => {
                        info!(payment_id = %payment_id, "Payment rejected");
                        yield PollEvent::Finished(PollVerdict::Rejected(status));
                        return;
                    }
                    ResponseStatus::DeadlineExpired => {
                        yield PollEvent::Finished(PollVerdict::TimedOut {
                            last_status: Some(status),
                        });
                        return;
                    }
                    other => {
                        last_status = Some(other.clone());
                        yield PollEvent::Checking(other);
                    }
                }

                if attempt < budget.retries {
                    tokio::time::sleep(budget.delay).await;
                }
            }
            info!(payment_id = %payment_id, retries = budget.retries, "Polling budget exhausted");
            yield PollEvent::Finished(PollVerdict::TimedOut { last_status });
        }
    }
}
