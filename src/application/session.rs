//! Owner of the flows of one host screen.
//!
//! Holds at most one instance per payment method. Creating a new instance
//! stops the previous one of the same method.

use super::card::CardPaymentFlow;
use super::handoff::{
    AppWalletFlow, AppWalletMethod, DeepLinkWalletFlow, DeepLinkWalletMethod, SbpMethod,
    SbpPaymentFlow,
};
use super::process::PaymentProcess;
use super::recurrent::RecurrentChargeFlow;
use super::token_wallet::TokenWalletFlow;
use crate::domain::configuration::PaymentConfiguration;
use crate::domain::ports::{AcquiringApiRef, AppResolverRef, ThreeDsDataCollectorRef};
use crate::error::Result;
use crate::settings::FlowSettings;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Default)]
struct Flows {
    card: Option<CardPaymentFlow>,
    recurrent: Option<RecurrentChargeFlow>,
    sbp: Option<SbpPaymentFlow>,
    deep_link_wallet: Option<DeepLinkWalletFlow>,
    app_wallet: Option<AppWalletFlow>,
    token_wallet: Option<TokenWalletFlow>,
    process: Option<PaymentProcess>,
}

pub struct PaymentSession {
    api: AcquiringApiRef,
    collector: ThreeDsDataCollectorRef,
    resolver: AppResolverRef,
    settings: FlowSettings,
    flows: Mutex<Flows>,
}

impl PaymentSession {
    pub fn new(
        api: AcquiringApiRef,
        collector: ThreeDsDataCollectorRef,
        resolver: AppResolverRef,
        settings: FlowSettings,
    ) -> Self {
        Self {
            api,
            collector,
            resolver,
            settings,
            flows: Mutex::new(Flows::default()),
        }
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn init_card(&self) -> CardPaymentFlow {
        let flow = CardPaymentFlow::new(self.api.clone(), self.collector.clone());
        if let Some(previous) = self.flows.lock().card.replace(flow.clone()) {
            debug!("Replacing card flow");
            previous.stop();
        }
        flow
    }

    pub fn init_recurrent(&self) -> RecurrentChargeFlow {
        let flow = RecurrentChargeFlow::new(self.api.clone(), self.collector.clone());
        if let Some(previous) = self.flows.lock().recurrent.replace(flow.clone()) {
            debug!("Replacing recurrent flow");
            previous.stop();
        }
        flow
    }

    pub fn init_sbp(&self) -> SbpPaymentFlow {
        let method = SbpMethod::new(self.resolver.clone(), self.settings.sbp_banks.clone())
            .with_budget(self.settings.sbp);
        let flow = SbpPaymentFlow::new(self.api.clone(), method);
        if let Some(previous) = self.flows.lock().sbp.replace(flow.clone()) {
            debug!("Replacing SBP flow");
            previous.stop();
        }
        flow
    }

    pub fn init_deep_link_wallet(&self) -> DeepLinkWalletFlow {
        let method = DeepLinkWalletMethod::new(self.settings.wallet_version.clone())
            .with_budget(self.settings.deep_link_wallet);
        let flow = DeepLinkWalletFlow::new(self.api.clone(), method);
        if let Some(previous) = self.flows.lock().deep_link_wallet.replace(flow.clone()) {
            debug!("Replacing deep-link wallet flow");
            previous.stop();
        }
        flow
    }

    pub fn init_app_wallet(&self) -> AppWalletFlow {
        let method = AppWalletMethod::new().with_budget(self.settings.app_wallet);
        let flow = AppWalletFlow::new(self.api.clone(), method);
        if let Some(previous) = self.flows.lock().app_wallet.replace(flow.clone()) {
            debug!("Replacing app wallet flow");
            previous.stop();
        }
        flow
    }

    pub fn init_token_wallet(
        &self,
        config: &PaymentConfiguration,
        wallet_token: impl Into<String>,
    ) -> Result<TokenWalletFlow> {
        let flow = TokenWalletFlow::create(self.api.clone(), config, wallet_token)?;
        if let Some(previous) = self.flows.lock().token_wallet.replace(flow.clone()) {
            debug!("Replacing token wallet flow");
            previous.stop();
        }
        Ok(flow)
    }

    pub fn init_process(&self) -> PaymentProcess {
        let process = PaymentProcess::new(self.api.clone(), self.collector.clone());
        if let Some(previous) = self.flows.lock().process.replace(process.clone()) {
            debug!("Replacing payment process");
            previous.stop();
        }
        process
    }

    pub fn card(&self) -> Option<CardPaymentFlow> {
        self.flows.lock().card.clone()
    }

    pub fn recurrent(&self) -> Option<RecurrentChargeFlow> {
        self.flows.lock().recurrent.clone()
    }

    pub fn sbp(&self) -> Option<SbpPaymentFlow> {
        self.flows.lock().sbp.clone()
    }

    pub fn deep_link_wallet(&self) -> Option<DeepLinkWalletFlow> {
        self.flows.lock().deep_link_wallet.clone()
    }

    pub fn app_wallet(&self) -> Option<AppWalletFlow> {
        self.flows.lock().app_wallet.clone()
    }

    pub fn token_wallet(&self) -> Option<TokenWalletFlow> {
        self.flows.lock().token_wallet.clone()
    }

    pub fn process(&self) -> Option<PaymentProcess> {
        self.flows.lock().process.clone()
    }

    /// Stops every owned flow. The instances stay reachable.
    pub fn stop_all(&self) {
        let flows = self.flows.lock();
        if let Some(flow) = &flows.card {
            flow.stop();
        }
        if let Some(flow) = &flows.recurrent {
            flow.stop();
        }
        if let Some(flow) = &flows.sbp {
            flow.stop();
        }
        if let Some(flow) = &flows.deep_link_wallet {
            flow.stop();
        }
        if let Some(flow) = &flows.app_wallet {
            flow.stop();
        }
        if let Some(flow) = &flows.token_wallet {
            flow.stop();
        }
        if let Some(process) = &flows.process {
            process.stop();
        }
    }
}

impl Drop for PaymentSession {
    fn drop(&mut self) {
        self.stop_all();
    }
}
