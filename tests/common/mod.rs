#![allow(dead_code)]

use acquiring_flows::application::state::FlowState;
use acquiring_flows::domain::configuration::{
    Amount, CustomerOptions, OrderOptions, PaymentConfiguration,
};
use acquiring_flows::domain::payment::{CardData, PaymentSource};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

pub fn configuration(coins: u64) -> PaymentConfiguration {
    PaymentConfiguration::new(
        OrderOptions {
            order_id: "order-42".to_string(),
            amount: Amount::from_coins(coins).unwrap(),
            description: Some("Test order".to_string()),
            recurrent_payment: false,
            receipt: None,
            shops: Vec::new(),
            success_url: None,
            fail_url: None,
            additional_data: BTreeMap::new(),
        },
        CustomerOptions {
            customer_key: Some("customer-1".to_string()),
            ..Default::default()
        },
    )
    .unwrap()
}

pub fn card() -> PaymentSource {
    PaymentSource::Card(CardData {
        pan: "2201382000000013".to_string(),
        expiry: "12/30".to_string(),
        cvc: "123".to_string(),
    })
}

/// Waits until the cell holds a state matching `done`, or panics after a second.
pub async fn wait_for<S, F>(rx: &mut watch::Receiver<S>, done: F) -> S
where
    S: FlowState,
    F: Fn(&S) -> bool,
{
    let reached = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let state = rx.borrow_and_update().clone();
            if done(&state) {
                return state;
            }
            rx.changed().await.unwrap();
        }
    })
    .await;
    match reached {
        Ok(state) => state,
        Err(_) => panic!("state not reached, last {:?}", *rx.borrow()),
    }
}

/// Collects every state name the receiver observes until a final state.
pub async fn collect_until_final<S: FlowState>(rx: &mut watch::Receiver<S>) -> Vec<S> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let state = rx.borrow_and_update().clone();
            let done = state.is_final();
            seen.push(state);
            if done {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    seen
}
