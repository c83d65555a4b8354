//! Drives one flow against a scripted backend and records what it observes.
//!
//! A scenario names the payment method, the order, the answers the backend
//! gives and what the simulated customer does at each pause point.

use super::csv::state_writer::TraceRow;
use crate::application::card::CardPaymentState;
use crate::application::handoff::sbp::SbpTarget;
use crate::application::handoff::{HandoffFlow, HandoffMethod, HandoffState};
use crate::application::recurrent::RecurrentPaymentState;
use crate::application::session::PaymentSession;
use crate::application::state::FlowState;
use crate::application::token_wallet::TokenWalletState;
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{
    ChargeResponse, FinishAuthorizeResponse, InitResponse, PaymentId, PaymentResult,
    PaymentSource, ResponseStatus, ThreeDsVersionResponse,
};
use crate::error::{AcquiringError, Result};
use crate::infrastructure::in_memory::{
    InstalledApps, Scripted, ScriptedAcquiringApi, StaticDeviceData,
};
use crate::settings::FlowSettings;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMethod {
    Card,
    Recurrent,
    Sbp,
    DeepLinkWallet,
    AppWallet,
    TokenWallet,
}

fn default_latency_ms() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub method: FlowMethod,
    pub config: PaymentConfiguration,
    #[serde(default)]
    pub email: Option<String>,
    /// Payment initialized outside the flow.
    #[serde(default)]
    pub payment_id: Option<PaymentId>,
    /// Card or attached card, for the card-shaped methods.
    #[serde(default)]
    pub source: Option<PaymentSource>,
    #[serde(default)]
    pub wallet_token: Option<String>,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub responses: ScriptedResponses,
    #[serde(default)]
    pub intents: UserIntents,
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Backend answers, consumed in order per operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptedResponses {
    pub init: Vec<Scripted<InitResponse>>,
    pub check_3ds: Vec<Scripted<ThreeDsVersionResponse>>,
    pub finish_authorize: Vec<Scripted<FinishAuthorizeResponse>>,
    pub charge: Vec<Scripted<ChargeResponse>>,
    pub statuses: Vec<Scripted<ResponseStatus>>,
    pub deep_link: Vec<Scripted<String>>,
    /// Rebill id to card id.
    pub cards: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreeDsIntent {
    Success,
    Fail,
}

/// What the simulated customer does when a flow pauses.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserIntents {
    pub installed_apps: Vec<String>,
    pub cvc: Option<String>,
    pub three_ds: Option<ThreeDsIntent>,
    pub reauth_token: Option<String>,
    #[serde(default = "default_true")]
    pub leave_to_bank_app: bool,
    pub check_retries: Option<u32>,
}

impl Default for UserIntents {
    fn default() -> Self {
        Self {
            installed_apps: Vec::new(),
            cvc: None,
            three_ds: None,
            reauth_token: None,
            leave_to_bank_app: true,
            check_retries: None,
        }
    }
}

impl UserIntents {
    fn three_ds_result(
        &self,
        payment_id: PaymentId,
    ) -> Option<std::result::Result<PaymentResult, AcquiringError>> {
        self.three_ds.map(|intent| match intent {
            ThreeDsIntent::Success => Ok(PaymentResult {
                payment_id,
                card_id: None,
                rebill_id: None,
            }),
            ThreeDsIntent::Fail => Err(AcquiringError::ThreeDsFailed(
                "challenge declined by cardholder".to_string(),
            )),
        })
    }
}

/// Per-state text for the `detail` column.
pub trait TraceDetail {
    fn detail(&self) -> String;
}

fn result_detail(result: &PaymentResult) -> String {
    match (&result.card_id, &result.rebill_id) {
        (Some(card), Some(rebill)) => format!("card_id={card} rebill_id={rebill}"),
        (Some(card), None) => format!("card_id={card}"),
        (None, Some(rebill)) => format!("rebill_id={rebill}"),
        (None, None) => String::new(),
    }
}

impl TraceDetail for CardPaymentState {
    fn detail(&self) -> String {
        match self {
            Self::ThreeDsUiNeeded { challenge } => format!("acs_url={}", challenge.acs_url),
            Self::CvcUiNeeded { rejection, .. } | Self::CvcUiInProcess { rejection, .. } => {
                format!("rejected={}", rejection.rejected_payment_id)
            }
            Self::Success(result) => result_detail(result),
            Self::Error { error, .. } => error.to_string(),
            _ => String::new(),
        }
    }
}

impl TraceDetail for RecurrentPaymentState {
    fn detail(&self) -> String {
        match self {
            Self::ThreeDsUiNeeded { challenge } => format!("acs_url={}", challenge.acs_url),
            Self::CvcUiNeeded { rejection, .. } | Self::CvcUiInProcess { rejection, .. } => {
                format!("rejected={}", rejection.rejected_payment_id)
            }
            Self::Success(result) => result_detail(result),
            Self::Error { error, .. } => error.to_string(),
            _ => String::new(),
        }
    }
}

impl TraceDetail for TokenWalletState {
    fn detail(&self) -> String {
        match self {
            Self::ThreeDsUiNeeded { challenge } => format!("acs_url={}", challenge.acs_url),
            Self::ReauthNeeded { rejection, .. } => {
                format!("rejected={}", rejection.rejected_payment_id)
            }
            Self::Success(result) => result_detail(result),
            Self::Error { error, .. } => error.to_string(),
            _ => String::new(),
        }
    }
}

/// Hand-off targets render themselves in the `need_choose_on_ui` row.
pub trait TargetDetail {
    fn detail(&self) -> String;
}

impl TargetDetail for SbpTarget {
    fn detail(&self) -> String {
        let banks: Vec<&str> = self.banks.iter().map(|b| b.package_name.as_str()).collect();
        format!("banks={}", banks.join(";"))
    }
}

impl TargetDetail for String {
    fn detail(&self) -> String {
        format!("link={self}")
    }
}

impl<T: TargetDetail> TraceDetail for HandoffState<T> {
    fn detail(&self) -> String {
        match self {
            Self::NeedChooseOnUi { target, .. } => target.detail(),
            Self::CheckingStatus {
                status: Some(status),
                ..
            } => status.to_string(),
            Self::Success {
                card_id, rebill_id, ..
            } => result_detail(&PaymentResult {
                payment_id: PaymentId(0),
                card_id: card_id.clone(),
                rebill_id: rebill_id.clone(),
            }),
            Self::PaymentFailed {
                cause, error_code, ..
            } => match error_code {
                Some(code) => format!("{code}: {cause}"),
                None => cause.to_string(),
            },
            _ => String::new(),
        }
    }
}

enum Step {
    Wait,
    Done,
}

#[derive(Default)]
struct Trace {
    rows: Vec<TraceRow>,
}

impl Trace {
    fn record<S: FlowState + TraceDetail>(&mut self, state: &S) {
        self.rows.push(TraceRow {
            step: self.rows.len(),
            state: state.name().to_string(),
            payment_id: state.payment_id(),
            detail: state.detail(),
        });
    }
}

/// Runs `scenario` to completion and returns the observed states.
pub async fn run(scenario: Scenario, settings: FlowSettings) -> Result<Vec<TraceRow>> {
    let api = Arc::new(ScriptedAcquiringApi::new());
    api.set_latency(Duration::from_millis(scenario.latency_ms));
    load_responses(&api, &scenario.responses);

    let session = PaymentSession::new(
        api.clone(),
        Arc::new(StaticDeviceData::default()),
        Arc::new(InstalledApps::new(scenario.intents.installed_apps.clone())),
        settings,
    );
    info!(method = ?scenario.method, order_id = %scenario.config.order.order_id, "Running scenario");

    let mut trace = Trace::default();
    let deadline = Instant::now() + Duration::from_millis(scenario.timeout_ms);
    let outcome = drive(&session, &scenario, &mut trace, deadline).await;
    session.stop_all();
    outcome?;

    debug!(rows = trace.rows.len(), "Scenario settled");
    Ok(trace.rows)
}

fn load_responses(api: &ScriptedAcquiringApi, responses: &ScriptedResponses) {
    for response in &responses.init {
        api.script_init(response.clone());
    }
    for response in &responses.check_3ds {
        api.script_check_3ds(response.clone());
    }
    for response in &responses.finish_authorize {
        api.script_finish_authorize(response.clone());
    }
    for response in &responses.charge {
        api.script_charge(response.clone());
    }
    for response in &responses.statuses {
        api.script_status(response.clone());
    }
    for response in &responses.deep_link {
        api.script_deep_link(response.clone());
    }
    for (rebill_id, card_id) in &responses.cards {
        api.register_card(rebill_id, card_id);
    }
}

fn require_source(scenario: &Scenario) -> Result<PaymentSource> {
    scenario.source.clone().ok_or_else(|| {
        AcquiringError::Scenario(format!("method {:?} needs a payment source", scenario.method))
    })
}

async fn drive(
    session: &PaymentSession,
    scenario: &Scenario,
    trace: &mut Trace,
    deadline: Instant,
) -> Result<()> {
    let config = &scenario.config;
    let email = scenario.email.as_deref();
    let intents = &scenario.intents;

    match scenario.method {
        FlowMethod::Card => {
            let source = require_source(scenario)?;
            let flow = session.init_card();
            let rx = flow.subscribe();
            flow.start(source, config, email)?;
            observe(rx, deadline, trace, |state| {
                Ok(match state {
                    CardPaymentState::ThreeDsUiNeeded { .. } if intents.three_ds.is_some() => {
                        flow.go_to_3ds();
                        Step::Wait
                    }
                    CardPaymentState::ThreeDsUiNeeded { .. } => Step::Done,
                    CardPaymentState::ThreeDsInProcess { payment_id } => {
                        if let Some(result) = intents.three_ds_result(*payment_id) {
                            flow.set_3ds_result(result);
                        }
                        Step::Wait
                    }
                    _ => Step::Wait,
                })
            })
            .await
        }
        FlowMethod::Recurrent => {
            let card = match require_source(scenario)? {
                PaymentSource::Attached(card) => card,
                _ => {
                    return Err(AcquiringError::Scenario(
                        "recurrent method needs an attached card".to_string(),
                    ));
                }
            };
            let rebill_id = card.rebill_id.clone().unwrap_or_default();
            let flow = session.init_recurrent();
            let rx = flow.subscribe();
            flow.start(card, config, email)?;
            observe(rx, deadline, trace, |state| {
                Ok(match state {
                    RecurrentPaymentState::CvcUiNeeded { .. } if intents.cvc.is_some() => {
                        flow.cvc_ui_shown();
                        Step::Wait
                    }
                    RecurrentPaymentState::CvcUiInProcess { rejection, .. } => {
                        let cvc = intents.cvc.as_deref().unwrap_or_default();
                        flow.start_with_cvc(
                            cvc,
                            &rebill_id,
                            rejection.rejected_payment_id,
                            config,
                            email,
                        )?;
                        Step::Wait
                    }
                    RecurrentPaymentState::CvcUiNeeded { .. } => Step::Done,
                    RecurrentPaymentState::ThreeDsUiNeeded { .. } if intents.three_ds.is_some() => {
                        flow.go_to_3ds();
                        Step::Wait
                    }
                    RecurrentPaymentState::ThreeDsUiNeeded { .. } => Step::Done,
                    RecurrentPaymentState::ThreeDsInProcess { payment_id } => {
                        if let Some(result) = intents.three_ds_result(*payment_id) {
                            flow.set_3ds_result(result);
                        }
                        Step::Wait
                    }
                    _ => Step::Wait,
                })
            })
            .await
        }
        FlowMethod::Sbp => {
            let flow = session.init_sbp();
            drive_handoff(&flow, scenario, trace, deadline).await
        }
        FlowMethod::DeepLinkWallet => {
            let flow = session.init_deep_link_wallet();
            drive_handoff(&flow, scenario, trace, deadline).await
        }
        FlowMethod::AppWallet => {
            let flow = session.init_app_wallet();
            drive_handoff(&flow, scenario, trace, deadline).await
        }
        FlowMethod::TokenWallet => {
            let wallet_token = scenario.wallet_token.clone().ok_or_else(|| {
                AcquiringError::Scenario("token_wallet method needs a wallet_token".to_string())
            })?;
            let flow = session.init_token_wallet(config, wallet_token)?;
            let rx = flow.subscribe();
            flow.start(scenario.payment_id);
            observe(rx, deadline, trace, |state| {
                Ok(match state {
                    TokenWalletState::ReauthNeeded { .. } => match &intents.reauth_token {
                        Some(token) => {
                            flow.reauthorize(token.clone())?;
                            Step::Wait
                        }
                        None => Step::Done,
                    },
                    TokenWalletState::ThreeDsUiNeeded { .. } if intents.three_ds.is_some() => {
                        flow.go_to_3ds();
                        Step::Wait
                    }
                    TokenWalletState::ThreeDsUiNeeded { .. } => Step::Done,
                    TokenWalletState::ThreeDsInProcess { payment_id } => {
                        if let Some(result) = intents.three_ds_result(*payment_id) {
                            flow.set_3ds_result(result);
                        }
                        Step::Wait
                    }
                    _ => Step::Wait,
                })
            })
            .await
        }
    }
}

async fn drive_handoff<M>(
    flow: &HandoffFlow<M>,
    scenario: &Scenario,
    trace: &mut Trace,
    deadline: Instant,
) -> Result<()>
where
    M: HandoffMethod,
    M::Target: TargetDetail,
{
    let intents = &scenario.intents;
    let rx = flow.subscribe();
    flow.start(&scenario.config, scenario.payment_id)?;
    observe(rx, deadline, trace, |state| {
        Ok(match state {
            HandoffState::NeedChooseOnUi { .. } if intents.leave_to_bank_app => {
                flow.going_to_bank_app();
                Step::Wait
            }
            HandoffState::NeedChooseOnUi { .. } | HandoffState::Stopped { .. } => Step::Done,
            HandoffState::LeaveOnBankApp { .. } => {
                flow.start_checking_status(intents.check_retries);
                Step::Wait
            }
            _ => Step::Wait,
        })
    })
    .await
}

/// Records every observed state and lets `react` play the customer until the
/// flow is final, `react` gives up, or the deadline passes.
async fn observe<S, F>(
    mut rx: watch::Receiver<S>,
    deadline: Instant,
    trace: &mut Trace,
    mut react: F,
) -> Result<()>
where
    S: FlowState + TraceDetail,
    F: FnMut(&S) -> Result<Step>,
{
    loop {
        let state = rx.borrow_and_update().clone();
        trace.record(&state);
        if state.is_final() {
            return Ok(());
        }
        if let Step::Done = react(&state)? {
            return Ok(());
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Ok(()),
            Err(_) => {
                return Err(AcquiringError::Scenario(format!(
                    "flow did not settle, last state {}",
                    state.name()
                )));
            }
        }
    }
}
