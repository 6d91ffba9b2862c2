use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelope::{Envelope, Message};
use exponential_backoff::Backoff;
use models::{channels, FamilyCapacity, FamilyId, ServiceId};

use crate::{Context, Error};

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// How long to wait for the registry's directed response per attempt.
    pub response_timeout: Duration,
    /// Attempts before the boot fails.
    pub attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            attempts: 5,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
        }
    }
}

/// Join the registry: publish a registration request under the temporary
/// id, await the directed response, and adopt the assigned permanent id.
/// Retries with backoff; exhausting every attempt is fatal to the boot.
pub async fn register(
    ctx: &Context,
    families: &BTreeMap<FamilyId, FamilyCapacity>,
    config: &RegistrationConfig,
) -> Result<ServiceId, Error> {
    let backoff = {
        let mut backoff = Backoff::new(config.attempts, config.backoff_min, Some(config.backoff_max));
        backoff.set_factor(2);
        backoff.set_jitter(0.2);
        backoff
    };

    for attempt in 1..=config.attempts {
        match attempt_once(ctx, families, config.response_timeout).await {
            Ok(assigned) => {
                adopt(ctx, &assigned);
                tracing::info!(id = %assigned, "registered with the registry");
                return Ok(assigned);
            }
            Err(Error::Bus(bus::Error::Timeout { .. })) => {
                let delay = backoff.next(attempt).unwrap_or(config.backoff_max);
                tracing::warn!(attempt, ?delay, "registration timed out, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(Error::RegistrationExhausted {
        attempts: config.attempts,
    })
}

async fn attempt_once(
    ctx: &Context,
    families: &BTreeMap<FamilyId, FamilyCapacity>,
    timeout: Duration,
) -> Result<ServiceId, Error> {
    let (request, response_channel) = {
        let identity = ctx.identity.read().unwrap();
        let request = Message::RegistrationRequest(models::RegistrationRequest {
            role: identity.role,
            family: identity.family.clone(),
            address: identity.address.clone(),
            service_version: identity.version.clone(),
            capabilities: identity.capabilities.clone(),
            permanent_id: identity.permanent_id.clone(),
            families: families.clone(),
        });
        (request, channels::registration_response(&identity.temp_id))
    };

    // One-shot wait on the directed response channel for the temp id.
    let (tx, rx) = tokio::sync::oneshot::channel::<Envelope>();
    let waiter = Arc::new(Mutex::new(Some(tx)));
    let token = ctx.bus.subscribe(
        &response_channel,
        bus::handler(move |envelope| {
            let waiter = waiter.clone();
            async move {
                if let Some(tx) = waiter.lock().unwrap().take() {
                    let _ = tx.send(envelope);
                }
            }
        }),
    );

    ctx.bus.publish(channels::REGISTRATION_REQUEST, &request)?;

    let outcome = tokio::time::timeout(timeout, rx).await;
    ctx.bus.unsubscribe(token);

    let envelope = match outcome {
        Ok(Ok(envelope)) => envelope,
        Ok(Err(_closed)) => return Err(Error::Bus(bus::Error::Closed)),
        Err(_elapsed) => {
            return Err(Error::Bus(bus::Error::Timeout {
                channel: response_channel,
                timeout,
            }))
        }
    };

    match envelope.message()? {
        Message::RegistrationResponse(response) if response.success => {
            response.assigned_server_id.ok_or(Error::RegistrationRejected {
                reason: "response carried no assigned id".to_string(),
            })
        }
        Message::RegistrationResponse(response) => Err(Error::RegistrationRejected {
            reason: response
                .reason
                .unwrap_or_else(|| "unspecified".to_string()),
        }),
        other => Err(Error::RegistrationRejected {
            reason: format!("unexpected response message {:?}", other.message_type()),
        }),
    }
}

fn adopt(ctx: &Context, assigned: &ServiceId) {
    {
        let mut identity = ctx.identity.write().unwrap();
        identity.permanent_id = Some(assigned.clone());
    }
    ctx.bus.set_sender_id(assigned.as_str());
}

/// Answer registry `reregister` broadcasts by re-submitting the current
/// identity. The permanent id rides along so the registry can match this
/// service to its previous entry and keep the id stable.
pub fn install_reregister_responder(
    ctx: &Context,
    families: Arc<std::sync::RwLock<BTreeMap<FamilyId, FamilyCapacity>>>,
) -> bus::SubscriptionToken {
    let bus = ctx.bus.clone();
    let identity = ctx.identity.clone();

    ctx.bus.subscribe(
        channels::REGISTRATION_REREGISTER,
        bus::handler(move |_envelope| {
            let bus = bus.clone();
            let identity = identity.clone();
            let families = families.clone();
            async move {
                let request = {
                    let identity = identity.read().unwrap();
                    Message::RegistrationRequest(models::RegistrationRequest {
                        role: identity.role,
                        family: identity.family.clone(),
                        address: identity.address.clone(),
                        service_version: identity.version.clone(),
                        capabilities: identity.capabilities.clone(),
                        permanent_id: identity.permanent_id.clone(),
                        families: families.read().unwrap().clone(),
                    })
                };
                if let Err(err) = bus.publish(channels::REGISTRATION_REQUEST, &request) {
                    tracing::warn!(error = %err, "failed to answer a reregister broadcast");
                }
            }
        }),
    )
}
