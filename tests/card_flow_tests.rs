mod common;

use acquiring_flows::application::card::{CardPaymentFlow, CardPaymentState};
use acquiring_flows::application::state::FlowState;
use acquiring_flows::domain::configuration::{DATA_KEY_FAIL_SESSION, DATA_KEY_RECURRING_TYPE};
use acquiring_flows::domain::payment::{
    AttachedCard, FinishAuthorizeResponse, PaymentId, PaymentResult, PaymentSource,
    RejectionRecord, ResponseStatus, ThreeDsChallenge, ThreeDsVersionResponse,
};
use acquiring_flows::error::AcquiringError;
use acquiring_flows::infrastructure::in_memory::{
    ScriptedAcquiringApi, ScriptedFailure, StaticDeviceData,
};
use common::{card, collect_until_final, configuration, wait_for};
use std::sync::Arc;
use std::time::Duration;

fn flow(api: &Arc<ScriptedAcquiringApi>) -> CardPaymentFlow {
    CardPaymentFlow::new(api.clone(), Arc::new(StaticDeviceData::default()))
}

fn challenge(payment_id: i64) -> ThreeDsChallenge {
    ThreeDsChallenge {
        payment_id: PaymentId(payment_id),
        acs_url: "https://acs.example/challenge".to_string(),
        version: "2.1.0".to_string(),
        tds_server_trans_id: Some("srv-1".to_string()),
        acs_trans_id: Some("acs-1".to_string()),
        pa_req: None,
        md: None,
    }
}

#[tokio::test]
async fn test_frictionless_payment_succeeds() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.script_payment_id(11);
    api.set_latency(Duration::from_millis(5));
    let flow = flow(&api);
    let mut rx = flow.subscribe();

    flow.start(card(), &configuration(2_500), None).unwrap();
    let seen = collect_until_final(&mut rx).await;

    let names: Vec<_> = seen.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["created", "started", "success"]);
    assert!(matches!(
        seen.last(),
        Some(CardPaymentState::Success(PaymentResult { payment_id: PaymentId(11), .. }))
    ));
}

#[tokio::test]
async fn test_challenge_then_success() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.script_payment_id(12);
    api.script_check_3ds(Ok(ThreeDsVersionResponse {
        version: "2.1.0".to_string(),
        server_trans_id: Some("srv-1".to_string()),
        three_ds_method_url: None,
        payment_system: Some("mir".to_string()),
    }));
    api.script_finish_authorize(Ok(FinishAuthorizeResponse {
        payment_id: Some(PaymentId(12)),
        card_id: None,
        rebill_id: None,
        status: Some(ResponseStatus::ThreeDsChecking),
        three_ds: Some(challenge(12)),
    }));
    let flow = flow(&api);
    let mut rx = flow.subscribe();
    flow.start(card(), &configuration(2_500), Some("buyer@example.com"))
        .unwrap();

    let needed = wait_for(&mut rx, |s| matches!(s, CardPaymentState::ThreeDsUiNeeded { .. })).await;
    assert!(matches!(needed, CardPaymentState::ThreeDsUiNeeded { ref challenge } if challenge.is_v2()));
    assert!(api.device_data()[0].is_some());
    assert_eq!(
        api.init_requests()[0].customer.email.as_deref(),
        Some("buyer@example.com")
    );

    flow.go_to_3ds();
    assert!(matches!(flow.state(), CardPaymentState::ThreeDsInProcess { payment_id: PaymentId(12) }));

    let result = PaymentResult {
        payment_id: PaymentId(12),
        card_id: Some("card-1".to_string()),
        rebill_id: None,
    };
    flow.set_3ds_result(Ok(result.clone()));
    flow.set_3ds_result(Err(AcquiringError::ThreeDsFailed("late".to_string())));
    assert!(matches!(flow.state(), CardPaymentState::Success(ref r) if *r == result));
}

#[tokio::test]
async fn test_v2_unsupported_surfaces_as_error() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.script_payment_id(13);
    api.script_finish_authorize(Err(ScriptedFailure::api("106")));
    let flow = flow(&api);
    let mut rx = flow.subscribe();
    flow.start(card(), &configuration(100), None).unwrap();

    let done = wait_for(&mut rx, FlowState::is_final).await;
    match done {
        CardPaymentState::Error { error, payment_id } => {
            assert!(matches!(*error, AcquiringError::ThreeDsV2Unsupported));
            assert_eq!(payment_id, Some(PaymentId(13)));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(api.calls("init"), 1);
}

#[tokio::test]
async fn test_init_without_payment_id_is_error() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.script_init(Ok(Default::default()));
    let flow = flow(&api);
    let mut rx = flow.subscribe();
    flow.start(card(), &configuration(100), None).unwrap();

    let done = wait_for(&mut rx, FlowState::is_final).await;
    assert!(matches!(
        done,
        CardPaymentState::Error { ref error, payment_id: None } if error.is_contract_violation()
    ));
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_synchronously() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    let flow = flow(&api);
    let mut config = configuration(100);
    config.order.order_id = "  ".to_string();

    let err = flow.start(card(), &config, None).unwrap_err();
    assert!(err.is_contract_violation());
    assert!(matches!(flow.state(), CardPaymentState::Created));
    assert_eq!(api.calls("init"), 0);
}

#[tokio::test]
async fn test_cvc_variant_adds_retry_markers() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    let flow = flow(&api);
    let config = configuration(100);
    flow.request_cvc(
        &config,
        RejectionRecord {
            rejected_payment_id: PaymentId(123),
            card_id: Some("card-1".to_string()),
        },
    );
    flow.cvc_ui_shown();
    assert!(matches!(flow.state(), CardPaymentState::CvcUiInProcess { .. }));

    let source = PaymentSource::Attached(AttachedCard {
        card_id: Some("card-1".to_string()),
        rebill_id: None,
        cvc: Some("321".to_string()),
    });
    let mut rx = flow.subscribe();
    flow.start(source, &config, None).unwrap();
    wait_for(&mut rx, FlowState::is_final).await;

    let sent = &api.init_requests()[0].order.additional_data;
    assert_eq!(sent.get(DATA_KEY_FAIL_SESSION).map(String::as_str), Some("123"));
    assert_eq!(sent.get(DATA_KEY_RECURRING_TYPE).map(String::as_str), Some("12"));
    assert!(config.order.additional_data.is_empty());
}

#[tokio::test]
async fn test_stop_keeps_last_state_and_drops_late_results() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.set_latency(Duration::from_millis(30));
    let flow = flow(&api);
    let mut rx = flow.subscribe();
    flow.start(card(), &configuration(100), None).unwrap();

    let started = wait_for(&mut rx, |s| matches!(s, CardPaymentState::Started { .. })).await;
    flow.stop();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(flow.state().name(), started.name());
    assert_eq!(api.calls("finish_authorize"), 0);
}

#[tokio::test]
async fn test_repeated_start_runs_one_payment() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.set_latency(Duration::from_millis(20));
    let flow = flow(&api);
    let mut rx = flow.subscribe();

    flow.start(card(), &configuration(100), None).unwrap();
    flow.start(card(), &configuration(100), None).unwrap();
    let done = wait_for(&mut rx, FlowState::is_final).await;
    flow.start(card(), &configuration(100), None).unwrap();

    assert!(matches!(
        done,
        CardPaymentState::Success(PaymentResult { payment_id: PaymentId(1), .. })
    ));
    assert_eq!(api.calls("init"), 1);
    assert_eq!(api.calls("finish_authorize"), 1);
}

#[tokio::test]
async fn test_repeated_start_from_cvc_prompt_runs_once() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.set_latency(Duration::from_millis(20));
    let flow = flow(&api);
    flow.request_cvc(
        &configuration(100),
        RejectionRecord {
            rejected_payment_id: PaymentId(123),
            card_id: Some("card-1".to_string()),
        },
    );
    let source = PaymentSource::Attached(AttachedCard {
        card_id: Some("card-1".to_string()),
        rebill_id: None,
        cvc: Some("321".to_string()),
    });
    let mut rx = flow.subscribe();

    flow.start(source.clone(), &configuration(100), None).unwrap();
    flow.start(source, &configuration(100), None).unwrap();
    wait_for(&mut rx, FlowState::is_final).await;

    assert_eq!(api.calls("init"), 1);
}

#[tokio::test]
async fn test_request_cvc_ignored_once_started() {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.set_latency(Duration::from_millis(20));
    let flow = flow(&api);
    let mut rx = flow.subscribe();
    flow.start(card(), &configuration(100), None).unwrap();
    wait_for(&mut rx, |s| matches!(s, CardPaymentState::Started { .. })).await;

    flow.request_cvc(
        &configuration(100),
        RejectionRecord {
            rejected_payment_id: PaymentId(1),
            card_id: None,
        },
    );
    assert!(matches!(flow.state(), CardPaymentState::Started { .. }));
    wait_for(&mut rx, FlowState::is_final).await;
    assert_eq!(api.calls("init"), 1);
}
