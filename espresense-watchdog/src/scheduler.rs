/**
 * SCHEDULER - Tick d'évaluation périodique des rooms
 *
 * RÔLE : toutes les `tick_interval`, snapshot du registre, décision par room,
 * restart des rooms en défaut, puis reset de `last_restarted` et cooldown.
 *
 * GARANTIES :
 * - les ticks ne se chevauchent jamais (le tick suivant attend la fin du précédent)
 * - chaque restart est borné par `restart_timeout`
 * - un shutdown pendant un restart abandonne l'appel sans écrire dans le registre
 */

use crate::clock::Clock;
use crate::health::HealthTracker;
use crate::policy::{Decision, RestartPolicy};
use crate::registry::DeviceRegistry;
use crate::restart::{RestartFailure, RestartOutcome, RestartTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub cooldown: Duration,
    pub restart_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            restart_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartAction {
    pub room: String,
    pub address: String,
    pub decision: Decision,
    pub outcome: RestartOutcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    pub actions: Vec<RestartAction>,
    /// Shutdown arrived before the tick could finish.
    pub interrupted: bool,
}

pub struct Watchdog<T> {
    registry: DeviceRegistry,
    policy: RestartPolicy,
    transport: T,
    clock: Arc<dyn Clock>,
    health: HealthTracker,
    settings: SchedulerSettings,
}

impl<T: RestartTransport> Watchdog<T> {
    pub fn new(
        registry: DeviceRegistry,
        policy: RestartPolicy,
        transport: T,
        clock: Arc<dyn Clock>,
        health: HealthTracker,
        settings: SchedulerSettings,
    ) -> Self {
        Self { registry, policy, transport, clock, health, settings }
    }

    /// One evaluation pass over a snapshot of the registry. Rooms are handled
    /// one after another; the registry lock is never held during a restart.
    pub async fn run_tick(&self, shutdown: &mut watch::Receiver<bool>) -> TickReport {
        let snapshot = self.registry.snapshot();
        let mut report = TickReport { evaluated: snapshot.len(), ..Default::default() };

        for (room, _) in snapshot {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            // earlier restarts in this tick may have taken seconds; decide on
            // the current entry, not the copy taken when the tick started
            let Some(state) = self.registry.get(&room) else {
                continue;
            };
            let decision = self.policy.evaluate(&state, self.clock.now());
            if !decision.needs_restart() {
                debug!(room = %room, "room is still actively posting");
                continue;
            }
            if decision == Decision::RestartDueToSilence {
                info!(room = %room, address = %state.address, "room hasn't posted in a while, restarting");
            } else {
                info!(room = %room, address = %state.address, "max uptime window reached, restarting");
            }

            let call = tokio::time::timeout(
                self.settings.restart_timeout,
                self.transport.restart(&room, &state.address),
            );
            let outcome = tokio::select! {
                res = call => res.unwrap_or(RestartOutcome::Failed(RestartFailure::Timeout(self.settings.restart_timeout))),
                _ = wait_for_shutdown(shutdown) => {
                    warn!(room = %room, "shutdown during restart, abandoning call");
                    report.interrupted = true;
                    break;
                }
            };

            // reset even on failure so an unreachable node is not hammered every tick
            self.registry.mark_restarted(&room, self.clock.now());
            self.health.restart_attempted(outcome.is_success());
            match &outcome {
                RestartOutcome::Succeeded => info!(room = %room, reason = decision.reason(), "restart sent"),
                RestartOutcome::Failed(e) => warn!(room = %room, reason = decision.reason(), error = %e, "restart failed, will retry on a later tick"),
            }
            report.actions.push(RestartAction { room, address: state.address, decision, outcome });

            if !self.settings.cooldown.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.cooldown) => {}
                    _ = wait_for_shutdown(shutdown) => {
                        report.interrupted = true;
                        break;
                    }
                }
            }
        }

        report
    }

    /// Runs ticks until the shutdown flag flips. A tick longer than the
    /// interval delays the next one instead of overlapping it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.settings.tick_interval.as_secs(),
            silence_secs = self.policy.silence_threshold.whole_seconds(),
            max_uptime_secs = self.policy.max_uptime.whole_seconds(),
            "starting watcher"
        );
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately; nothing to evaluate yet
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            let report = self.run_tick(&mut shutdown).await;
            let mut health = self.health.snapshot();
            health.rooms_tracked = self.registry.len();
            debug!(
                evaluated = report.evaluated,
                restarts = report.actions.len(),
                health = %serde_json::to_string(&health).unwrap_or_default(),
                "watcher tick done"
            );
            if report.interrupted {
                break;
            }
        }
        info!("watcher stopped");
    }
}

/// Resolves once the shutdown flag is set, or the sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
