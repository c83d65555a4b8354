use acquiring_flows::application::poller::{PollEvent, PollVerdict, PollingBudget, StatusPoller};
use acquiring_flows::domain::payment::{PaymentId, ResponseStatus};
use acquiring_flows::infrastructure::in_memory::ScriptedAcquiringApi;
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

async fn run(api: Arc<ScriptedAcquiringApi>, retries: u32) -> Vec<PollEvent> {
    StatusPoller::new(api)
        .poll(PaymentId(42), PollingBudget::new(retries, Duration::from_millis(1)))
        .map(|event| event.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn test_authorized_after_two_checks() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.script_statuses([
        ResponseStatus::Authorizing,
        ResponseStatus::Authorizing,
        ResponseStatus::Authorized,
    ]);

    let events = run(api.clone(), 5).await;
    assert_eq!(
        events,
        vec![
            PollEvent::Checking(ResponseStatus::Authorizing),
            PollEvent::Checking(ResponseStatus::Authorizing),
            PollEvent::Finished(PollVerdict::Success(ResponseStatus::Authorized)),
        ]
    );
    assert_eq!(api.calls("get_status"), 3);
}

#[tokio::test]
async fn test_budget_exhausted_before_sixth_answer() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.script_statuses(std::iter::repeat_n(ResponseStatus::Authorizing, 6));

    let events = run(api.clone(), 5).await;
    assert_eq!(events.len(), 6);
    assert_eq!(
        events.last(),
        Some(&PollEvent::Finished(PollVerdict::TimedOut {
            last_status: Some(ResponseStatus::Authorizing),
        }))
    );
    assert_eq!(api.calls("get_status"), 5);
}

#[tokio::test]
async fn test_rejected_ends_polling() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.script_statuses([ResponseStatus::New, ResponseStatus::Rejected, ResponseStatus::Confirmed]);

    let events = run(api.clone(), 10).await;
    assert_eq!(
        events.last(),
        Some(&PollEvent::Finished(PollVerdict::Rejected(ResponseStatus::Rejected)))
    );
    assert_eq!(api.calls("get_status"), 2);
}

#[tokio::test]
async fn test_random_budgets_never_exceed_retries() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let retries = rng.gen_range(1..8);
        let pending = rng.gen_range(0..10);
        let api = Arc::new(ScriptedAcquiringApi::new());
        api.script_statuses(std::iter::repeat_n(ResponseStatus::Authorizing, pending));
        api.script_statuses([ResponseStatus::Confirmed]);

        let events = run(api.clone(), retries).await;
        let calls = api.calls("get_status");
        assert!(calls <= retries as usize);
        match events.last() {
            Some(PollEvent::Finished(PollVerdict::Success(_))) => {
                assert!(pending < retries as usize);
                assert_eq!(calls, pending + 1);
            }
            Some(PollEvent::Finished(PollVerdict::TimedOut { .. })) => {
                assert!(pending >= retries as usize);
                assert_eq!(calls, retries as usize);
            }
            other => panic!("unexpected last event {other:?}"),
        }
    }
}
