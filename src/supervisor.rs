use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tracing::info;

use crate::activity_pub::delivery::{DeliveryWorker, DeliveryWorkerInit, DeliveryWorkerMsg};
use crate::activity_pub::machine::{
    ActivityPubMachine, ActivityPubMachineInit, MACHINE_NAME, MachineMsg,
};
use crate::config::RuntimeConfig;

/// Root of the actor tree: the side-effect machine plus the delivery worker
/// pool, restarted in place when they fail.
pub(crate) struct Supervisor;

pub(crate) enum SupervisorMsg {}

pub(crate) struct SupervisorState {
    config: RuntimeConfig,
}

impl Actor for Supervisor {
    type Msg = SupervisorMsg;
    type State = SupervisorState;
    type Arguments = RuntimeConfig;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        config: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Actor::spawn_linked(
            Some(MACHINE_NAME.into()),
            ActivityPubMachine,
            ActivityPubMachineInit {
                config: config.init.clone(),
                keyspace: config.keyspace.clone(),
            },
            myself.get_cell(),
        )
        .await?;

        for n in 0..config.init.delivery_workers {
            Actor::spawn_linked(
                Some(format!("delivery_worker_{n}")),
                DeliveryWorker,
                DeliveryWorkerInit {
                    config: config.clone(),
                },
                myself.get_cell(),
            )
            .await?;
        }

        Ok(SupervisorState { config })
    }

    async fn post_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        info!(target: "lifecycle", "started");
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        use SupervisionEvent::*;

        match message {
            ActorStarted(_) => {}
            ActorTerminated(_, _, _) => {}
            ActorFailed(actor_cell, error) => {
                if matches!(actor_cell.is_message_type_of::<MachineMsg>(), Some(true)) {
                    info!(target: "supervision", %error, "machine crashed, restarting...");
                    Actor::spawn_linked(
                        Some(MACHINE_NAME.into()),
                        ActivityPubMachine,
                        ActivityPubMachineInit {
                            config: state.config.init.clone(),
                            keyspace: state.config.keyspace.clone(),
                        },
                        myself.get_cell(),
                    )
                    .await?;
                }
                if matches!(
                    actor_cell.is_message_type_of::<DeliveryWorkerMsg>(),
                    Some(true)
                ) {
                    info!(target: "supervision", %error, "delivery worker crashed, restarting...");
                    Actor::spawn_linked(
                        actor_cell.get_name(),
                        DeliveryWorker,
                        DeliveryWorkerInit {
                            config: state.config.clone(),
                        },
                        myself.get_cell(),
                    )
                    .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
