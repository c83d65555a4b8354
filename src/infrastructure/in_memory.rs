use crate::domain::configuration::PaymentConfiguration;
use crate::domain::payment::{
    BankApp, ChargeResponse, DeepLinkKind, DeviceData, FinishAuthorizeResponse, InitResponse,
    PaymentId, PaymentSource, ResponseStatus, ThreeDsVersionResponse,
};
use crate::domain::ports::{AcquiringApi, AppResolver, ThreeDsDataCollector};
use crate::error::{AcquiringError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::trace;

/// A scripted API failure, describable in scenario files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptedFailure {
    Api {
        code: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        payment_id: Option<PaymentId>,
        #[serde(default)]
        card_id: Option<String>,
    },
    Network {
        message: String,
    },
}

impl ScriptedFailure {
    pub fn api(code: &str) -> Self {
        Self::Api {
            code: code.to_string(),
            message: String::new(),
            payment_id: None,
            card_id: None,
        }
    }

    pub fn network(message: &str) -> Self {
        Self::Network {
            message: message.to_string(),
        }
    }

    fn to_error(&self) -> AcquiringError {
        match self {
            Self::Api {
                code,
                message,
                payment_id,
                card_id,
            } => AcquiringError::from_api(code.clone(), message.clone(), *payment_id, card_id.clone()),
            Self::Network { message } => AcquiringError::Network(message.clone()),
        }
    }
}

pub type Scripted<T> = std::result::Result<T, ScriptedFailure>;

#[derive(Default)]
struct Script {
    init: VecDeque<Scripted<InitResponse>>,
    check_3ds: VecDeque<Scripted<ThreeDsVersionResponse>>,
    finish: VecDeque<Scripted<FinishAuthorizeResponse>>,
    charge: VecDeque<Scripted<ChargeResponse>>,
    status: VecDeque<Scripted<ResponseStatus>>,
    deep_link: VecDeque<Scripted<String>>,
    cards: HashMap<String, String>,
    last_status: Option<ResponseStatus>,
    next_payment_id: i64,
    calls: HashMap<&'static str, usize>,
    init_requests: Vec<PaymentConfiguration>,
    device_data: Vec<Option<DeviceData>>,
}

/// In-memory acquiring backend answering from per-operation scripts.
///
/// Unscripted calls succeed with plausible defaults: init hands out
/// sequential payment ids, 3DS checks report v1, finish-authorize and charge
/// succeed without a challenge, and status repeats the last scripted value.
pub struct ScriptedAcquiringApi {
    script: Mutex<Script>,
    latency: Mutex<Duration>,
}

impl Default for ScriptedAcquiringApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAcquiringApi {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                next_payment_id: 1,
                ..Default::default()
            }),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Delay applied to every call, to keep work in flight.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn script_init(&self, response: Scripted<InitResponse>) {
        self.script.lock().init.push_back(response);
    }

    pub fn script_payment_id(&self, payment_id: i64) {
        self.script_init(Ok(InitResponse {
            payment_id: Some(PaymentId(payment_id)),
            status: Some(ResponseStatus::New),
        }));
    }

    pub fn script_check_3ds(&self, response: Scripted<ThreeDsVersionResponse>) {
        self.script.lock().check_3ds.push_back(response);
    }

    pub fn script_finish_authorize(&self, response: Scripted<FinishAuthorizeResponse>) {
        self.script.lock().finish.push_back(response);
    }

    pub fn script_charge(&self, response: Scripted<ChargeResponse>) {
        self.script.lock().charge.push_back(response);
    }

    pub fn script_statuses<I>(&self, statuses: I)
    where
        I: IntoIterator<Item = ResponseStatus>,
    {
        self.script.lock().status.extend(statuses.into_iter().map(Ok));
    }

    pub fn script_status(&self, response: Scripted<ResponseStatus>) {
        self.script.lock().status.push_back(response);
    }

    pub fn fail_status_with_network_error(&self) {
        self.script
            .lock()
            .status
            .push_back(Err(ScriptedFailure::network("status unavailable")));
    }

    pub fn script_deep_link(&self, response: Scripted<String>) {
        self.script.lock().deep_link.push_back(response);
    }

    pub fn register_card(&self, rebill_id: &str, card_id: &str) {
        self.script
            .lock()
            .cards
            .insert(rebill_id.to_string(), card_id.to_string());
    }

    /// Number of calls made to `operation`.
    pub fn calls(&self, operation: &str) -> usize {
        self.script.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Every configuration passed to `init`, in call order.
    pub fn init_requests(&self) -> Vec<PaymentConfiguration> {
        self.script.lock().init_requests.clone()
    }

    /// Device data passed to every `finish_authorize` call.
    pub fn device_data(&self) -> Vec<Option<DeviceData>> {
        self.script.lock().device_data.clone()
    }

    async fn enter(&self, operation: &'static str) {
        {
            let mut script = self.script.lock();
            *script.calls.entry(operation).or_default() += 1;
        }
        trace!(operation, "Scripted API call");
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn take<T>(queue: &mut VecDeque<Scripted<T>>) -> Option<Result<T>> {
    queue
        .pop_front()
        .map(|scripted| scripted.map_err(|failure| failure.to_error()))
}

#[async_trait]
impl AcquiringApi for ScriptedAcquiringApi {
    async fn init(&self, config: &PaymentConfiguration) -> Result<InitResponse> {
        self.enter("init").await;
        let mut script = self.script.lock();
        script.init_requests.push(config.clone());
        take(&mut script.init).unwrap_or_else(|| {
            let payment_id = PaymentId(script.next_payment_id);
            script.next_payment_id += 1;
            Ok(InitResponse {
                payment_id: Some(payment_id),
                status: Some(ResponseStatus::New),
            })
        })
    }

    async fn check_3ds_version(
        &self,
        _payment_id: PaymentId,
        _source: &PaymentSource,
        _config: &PaymentConfiguration,
    ) -> Result<ThreeDsVersionResponse> {
        self.enter("check_3ds_version").await;
        take(&mut self.script.lock().check_3ds).unwrap_or_else(|| {
            Ok(ThreeDsVersionResponse {
                version: "1.0.0".to_string(),
                server_trans_id: None,
                three_ds_method_url: None,
                payment_system: None,
            })
        })
    }

    async fn finish_authorize(
        &self,
        payment_id: PaymentId,
        source: &PaymentSource,
        _config: &PaymentConfiguration,
        device_data: Option<DeviceData>,
    ) -> Result<FinishAuthorizeResponse> {
        self.enter("finish_authorize").await;
        let mut script = self.script.lock();
        script.device_data.push(device_data);
        take(&mut script.finish).unwrap_or_else(|| {
            let card_id = match source {
                PaymentSource::Attached(card) => card.card_id.clone(),
                _ => None,
            };
            Ok(FinishAuthorizeResponse {
                payment_id: Some(payment_id),
                card_id,
                rebill_id: None,
                status: Some(ResponseStatus::Confirmed),
                three_ds: None,
            })
        })
    }

    async fn charge(&self, payment_id: PaymentId, rebill_id: &str) -> Result<ChargeResponse> {
        self.enter("charge").await;
        let mut script = self.script.lock();
        take(&mut script.charge).unwrap_or_else(|| {
            Ok(ChargeResponse {
                payment_id: Some(payment_id),
                card_id: script.cards.get(rebill_id).cloned(),
            })
        })
    }

    async fn get_status(&self, _payment_id: PaymentId) -> Result<ResponseStatus> {
        self.enter("get_status").await;
        let mut script = self.script.lock();
        match take(&mut script.status) {
            Some(Ok(status)) => {
                script.last_status = Some(status.clone());
                Ok(status)
            }
            Some(Err(err)) => Err(err),
            None => Ok(script.last_status.clone().unwrap_or(ResponseStatus::New)),
        }
    }

    async fn get_deep_link(&self, payment_id: PaymentId, kind: &DeepLinkKind) -> Result<String> {
        self.enter("get_deep_link").await;
        take(&mut self.script.lock().deep_link).unwrap_or_else(|| {
            Ok(match kind {
                DeepLinkKind::Sbp => format!("https://qr.nspk.ru/AS{payment_id}"),
                DeepLinkKind::DeepLinkWallet { version } => {
                    format!("walletpay://pay?version={version}&payment={payment_id}")
                }
                DeepLinkKind::AppWallet => format!("appwallet://pay?payment={payment_id}"),
            })
        })
    }

    async fn lookup_card_by_rebill_id(
        &self,
        rebill_id: &str,
        _config: &PaymentConfiguration,
    ) -> Result<String> {
        self.enter("lookup_card_by_rebill_id").await;
        self.script
            .lock()
            .cards
            .get(rebill_id)
            .cloned()
            .ok_or_else(|| AcquiringError::Api {
                code: "404".to_string(),
                message: format!("No card with rebill id {rebill_id}"),
                details: None,
            })
    }
}

/// App resolver backed by a fixed set of installed package names.
#[derive(Debug, Default, Clone)]
pub struct InstalledApps {
    packages: HashSet<String>,
}

impl InstalledApps {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl AppResolver for InstalledApps {
    async fn resolve_installed_handlers(
        &self,
        candidates: &[BankApp],
        deep_link: &str,
    ) -> Result<Vec<BankApp>> {
        let scheme = deep_link.split("://").next().unwrap_or_default();
        Ok(candidates
            .iter()
            .filter(|app| self.packages.contains(&app.package_name))
            .filter(|app| app.scheme.is_empty() || app.scheme == scheme)
            .cloned()
            .collect())
    }
}

/// Collector returning the same device data for every v2 authentication.
#[derive(Debug, Default, Clone)]
pub struct StaticDeviceData {
    data: DeviceData,
}

impl StaticDeviceData {
    pub fn new(data: DeviceData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ThreeDsDataCollector for StaticDeviceData {
    async fn collect(&self, version: &ThreeDsVersionResponse) -> Result<DeviceData> {
        let mut data = self.data.clone();
        if let Some(server_trans_id) = &version.server_trans_id {
            data.insert("threeDSServerTransID".to_string(), server_trans_id.clone());
        }
        Ok(data)
    }
}
