//! Event routing
//!
//! Every hop through a PID applies the event's engine-side effects on that PID before the
//! next filter sees it, so a filter that swallows an event still leaves the PID state right.

use std::sync::Arc;

use super::node::{FilterNode, PendingEvent};
use super::SessionShared;
use crate::error::{Error, Result};
use crate::event::{EventDirection, EventKind, EventTarget, FilterEvent};
use crate::pid::{PidInstance, PidShared};

fn apply_to_instance(inst: &PidInstance, kind: &EventKind) {
    match kind {
        EventKind::Play { speed, .. } => {
            inst.set_playing(true);
            inst.pid.set_speed(*speed);
        }
        EventKind::Stop => {
            inst.set_playing(false);
            let dropped = inst.flush();
            if dropped > 0 {
                tracing::debug!(pid = %inst.pid.name(), dropped, "STOP flushed queued packets");
            }
        }
        EventKind::SetSpeed { speed } => inst.pid.set_speed(*speed),
        _ => {}
    }
}

/// Delivers `event` to every consumer of `pid`
pub(crate) fn send_downstream(pid: &Arc<PidShared>, event: FilterEvent) {
    let event = event.retarget(pid.id);
    for inst in pid.destinations() {
        apply_to_instance(&inst, &event.kind);
        if let Some(consumer) = inst.consumer.upgrade() {
            consumer.push_event(PendingEvent {
                event: event.clone(),
                direction: EventDirection::Downstream,
            });
        }
    }
}

/// Delivers `event` to the producer of the PID `inst` consumes
pub(crate) fn send_upstream(inst: &Arc<PidInstance>, event: FilterEvent) {
    let event = event.retarget(inst.pid.id);
    apply_to_instance(inst, &event.kind);
    if let EventKind::BufferReq {
        max_buffer_us,
        pid_only,
        ..
    } = event.kind
    {
        inst.pid.set_buffer_limits(None, Some(max_buffer_us));
        if pid_only {
            return;
        }
    }
    if let Some(producer) = inst.pid.owner.upgrade() {
        producer.push_event(PendingEvent {
            event,
            direction: EventDirection::Upstream,
        });
    }
}

/// Default propagation of an event the filter did not handle
pub(crate) fn forward(node: &Arc<FilterNode>, pending: PendingEvent) {
    match pending.direction {
        EventDirection::Upstream => {
            for inst in node.input_instances() {
                send_upstream(&inst, pending.event.clone());
            }
        }
        EventDirection::Downstream => {
            for pid in node.output_pids() {
                send_downstream(&pid, pending.event.clone());
            }
        }
    }
}

/// Host-side event injection
///
/// Session-wide events start at every source (downstream) or every sink (upstream);
/// PID-targeted events start on that PID in the kind's natural direction.
pub(crate) fn send_from_session(shared: &SessionShared, event: FilterEvent) -> Result<()> {
    let filters = shared.graph.read().filters.clone();
    match event.target {
        EventTarget::Session(direction) => {
            let targets: Vec<_> = filters
                .into_iter()
                .filter(|n| !n.state().is_terminal())
                .filter(|n| match direction {
                    EventDirection::Downstream => n.is_source(),
                    EventDirection::Upstream => n.output_pids().is_empty(),
                })
                .collect();
            tracing::debug!(event = %event, filters = targets.len(), "session event");
            for node in targets {
                node.push_event(PendingEvent {
                    event: event.clone(),
                    direction,
                });
            }
            Ok(())
        }
        EventTarget::Pid(id) => {
            let pid = filters
                .iter()
                .flat_map(|n| n.output_pids())
                .find(|p| p.id == id)
                .ok_or_else(|| Error::BadParam(format!("no PID with id {}", id)))?;
            match event.kind.natural_direction() {
                EventDirection::Downstream => send_downstream(&pid, event),
                EventDirection::Upstream => match pid.destinations().first() {
                    Some(inst) => send_upstream(inst, event),
                    None => {
                        if let Some(producer) = pid.owner.upgrade() {
                            producer.push_event(PendingEvent {
                                event,
                                direction: EventDirection::Upstream,
                            });
                        }
                    }
                },
            }
            Ok(())
        }
    }
}
