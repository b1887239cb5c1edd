//! PID linking
//!
//! A new output PID is offered to every filter of the graph that may consume it. A consumer
//! whose capabilities accept the PID properties is attached directly; otherwise the linker
//! looks for a chain of registered filters, and the first filter of that chain is created
//! and attached with the consumer as its target. The rest of the chain is resolved the same
//! way once that filter declares its own outputs.

use std::collections::VecDeque;
use std::sync::Arc;

use super::node::{ConfigRequest, FilterNode, NodeInit, PendingEvent};
use super::{Graph, SessionShared};
use crate::caps::{first_matching_bundle, CapState, ChainStep, LinkRequest, Linker};
use crate::error::{Error, FilterError, Result};
use crate::event::{EventDirection, EventKind, FilterEvent};
use crate::filter::FilterId;
use crate::pid::{PidInstance, PidShared};
use crate::props::{PropertyKey, PropertyMap, PropertyValue};

/// Filters feeding `node`, transitively
fn ancestors(node: &FilterNode) -> Vec<FilterId> {
    let mut found = Vec::new();
    let mut todo: VecDeque<Arc<FilterNode>> = node
        .all_input_instances()
        .iter()
        .filter_map(|i| i.pid.owner.upgrade())
        .collect();
    while let Some(up) = todo.pop_front() {
        if found.contains(&up.id) {
            continue;
        }
        found.push(up.id);
        todo.extend(
            up.all_input_instances()
                .iter()
                .filter_map(|i| i.pid.owner.upgrade()),
        );
    }
    found
}

/// Creates the first filter of `chain`'s path toward `target`
fn instantiate_step(
    shared: &Arc<SessionShared>,
    graph: &mut Graph,
    step: &ChainStep,
    target: FilterId,
    forced_caps: PropertyMap,
) -> Result<Arc<FilterNode>> {
    let args = step.descriptor.default_args()?;
    let kind = step.descriptor.instantiate(&args)?;
    let id = graph.next_id();
    let node = graph.add(
        shared,
        NodeInit {
            id,
            name: step.descriptor.name.clone(),
            descriptor: step.descriptor.clone(),
            args,
            kind,
            dynamic: true,
            forced_caps,
            target: Some(target),
        },
    );
    tracing::debug!(filter = %node.name, id = %node.id, target = %target, "filter inserted by linker");
    Ok(node)
}

fn attach(pid: &Arc<PidShared>, consumer: &Arc<FilterNode>) -> Arc<PidInstance> {
    let inst = PidInstance::new(pid, consumer);
    consumer.links.write().pending_inputs.push(inst.clone());
    inst
}

/// Connects `pid` to the consumers found, returns how many were attached
fn link_pid(
    shared: &Arc<SessionShared>,
    producer: &Arc<FilterNode>,
    pid: &Arc<PidShared>,
    only: Option<FilterId>,
) -> usize {
    let props = pid.published_props().map.clone();
    let state = CapState::from_props(&props);
    let target = producer.links.read().target;
    let mut instances = Vec::new();
    {
        let mut graph = shared.graph.write();
        let upstream = ancestors(producer);
        let candidates: Vec<Arc<FilterNode>> = graph
            .filters
            .iter()
            .filter(|n| n.id != producer.id && !upstream.contains(&n.id))
            .filter(|n| only.map_or(true, |id| n.id == id))
            .filter(|n| match target {
                Some(t) => n.id == t,
                None => !n.dynamic && n.accepts_more_inputs(),
            })
            .filter(|n| {
                !n.state().is_terminal()
                    && n.descriptor.caps.has_inputs()
                    && n.accepts_source(producer)
            })
            .cloned()
            .collect();
        let linker = Linker::new(&shared.registry, shared.config.max_chain_length);
        for cand in candidates {
            if first_matching_bundle(&state, &cand.descriptor.caps).is_some() {
                tracing::debug!(pid = %pid.name(), from = %producer.name, to = %cand.name, "direct link");
                instances.push((cand.clone(), attach(pid, &cand)));
                continue;
            }
            let mut req = LinkRequest::new(state.clone(), &cand.descriptor.caps);
            req.allow_direct = false;
            let chain = match linker.resolve(&req) {
                Ok(chain) => chain,
                Err(e) => {
                    tracing::trace!(pid = %pid.name(), to = %cand.name, "no chain: {}", e);
                    continue;
                }
            };
            let Some(step) = chain.steps.first() else {
                continue;
            };
            match instantiate_step(shared, &mut graph, step, cand.id, PropertyMap::new()) {
                Ok(head) => {
                    tracing::info!(pid = %pid.name(), from = %producer.name, to = %cand.name, chain = %chain, "linked through filter chain");
                    instances.push((head.clone(), attach(pid, &head)));
                }
                Err(e) => {
                    tracing::warn!(filter = %step.descriptor.name, "failed to instantiate chain filter: {}", e);
                }
            }
        }
    }
    let insts: Vec<Arc<PidInstance>> = instances.iter().map(|(_, i)| i.clone()).collect();
    if !insts.is_empty() {
        pid.connect(&insts);
    }
    for (consumer, inst) in &instances {
        consumer.push_config(ConfigRequest::Connect(inst.clone()));
    }
    instances.len()
}

/// Links a freshly declared output PID of `producer`
pub(crate) fn link_output(shared: &Arc<SessionShared>, producer: &Arc<FilterNode>, pid: &Arc<PidShared>) {
    if link_pid(shared, producer, pid, None) > 0 {
        return;
    }
    let err = Error::FilterNotFound(format!(
        "no filter accepts PID '{}' of '{}'",
        pid.name(),
        producer.name
    ));
    tracing::warn!(filter = %producer.name, pid = %pid.name(), "{}", err);
    shared.record_connect_error(FilterError::new(&producer.name, &err));
    pid.mark_unconnected();
}

/// Offers unconnected PIDs to a filter added after they were declared
pub(crate) fn relink_unconnected(shared: &Arc<SessionShared>, new_node: &Arc<FilterNode>) {
    let filters = shared.graph.read().filters.clone();
    for producer in filters.iter().filter(|n| n.id != new_node.id) {
        for pid in producer.output_pids() {
            if pid.is_removed() || pid.link_state() != crate::pid::LinkState::Unconnected {
                continue;
            }
            if link_pid(shared, producer, &pid, Some(new_node.id)) > 0 {
                tracing::debug!(pid = %pid.name(), to = %new_node.name, "unconnected PID linked");
            }
        }
    }
}

/// A consumer refused a PID in `configure`
///
/// The queued packets are kept and handed to an alternate chain if one exists, so the
/// stream continues without loss; otherwise the producer gets a `CONNECT_FAIL` event.
pub(crate) fn on_configure_failure(
    shared: &Arc<SessionShared>,
    consumer: &Arc<FilterNode>,
    inst: &Arc<PidInstance>,
    err: Error,
) {
    let pid = inst.pid.clone();
    pid.detach(inst, true);
    let queued = inst.take_queue();
    shared.record_connect_error(FilterError::new(&consumer.name, &err));

    // a failed chain filter gives way to another path toward its own target
    let dest = if consumer.dynamic {
        consumer
            .links
            .read()
            .target
            .and_then(|t| shared.find_node(t))
            .unwrap_or_else(|| consumer.clone())
    } else {
        consumer.clone()
    };
    let props = pid.published_props().map.clone();
    let mut req = LinkRequest::new(CapState::from_props(&props), &dest.descriptor.caps);
    req.allow_direct = false;
    req.exclude.push(consumer.descriptor.name.clone());

    // a chain already ended at this consumer: do not build another one
    let producer_dynamic = pid.owner.upgrade().is_some_and(|p| p.dynamic);
    let alternate = if producer_dynamic && !consumer.dynamic {
        None
    } else {
        let mut graph = shared.graph.write();
        let linker = Linker::new(&shared.registry, shared.config.max_chain_length);
        match linker.resolve(&req) {
            Ok(chain) => match chain.steps.first() {
                Some(step) => instantiate_step(shared, &mut graph, step, dest.id, PropertyMap::new())
                    .map(|head| (head, chain))
                    .ok(),
                None => None,
            },
            Err(_) => None,
        }
    };

    if let Some((head, chain)) = alternate {
        tracing::info!(pid = %pid.name(), to = %dest.name, chain = %chain, "relinked through alternate chain");
        let new_inst = attach(&pid, &head);
        new_inst.prefill(queued);
        pid.connect(std::slice::from_ref(&new_inst));
        head.push_config(ConfigRequest::Connect(new_inst));
        return;
    }
    drop(queued);
    tracing::warn!(pid = %pid.name(), consumer = %consumer.name, "no alternate link: {}", err);
    if let Some(producer) = pid.owner.upgrade() {
        producer.push_event(PendingEvent {
            event: FilterEvent::on_pid(
                EventKind::ConnectFail {
                    reason: err.to_string(),
                },
                pid.id,
            ),
            direction: EventDirection::Upstream,
        });
    }
    if pid.destinations().is_empty() {
        pid.mark_unconnected();
    }
}

/// Checks that a negotiated value can be delivered, then asks the producer for it
pub(crate) fn request_negotiation(
    inst: &Arc<PidInstance>,
    key: PropertyKey,
    value: PropertyValue,
) -> Result<()> {
    let pid = &inst.pid;
    let producer = pid
        .owner
        .upgrade()
        .ok_or_else(|| Error::NotSupported(format!("producer of '{}' is gone", pid.name())))?;
    let consumer = inst
        .consumer
        .upgrade()
        .ok_or_else(|| Error::NotSupported("consumer is gone".into()))?;
    let shared = producer
        .session()
        .ok_or_else(|| Error::NotSupported("session is gone".into()))?;

    let producer_can = producer.descriptor.caps.bundles().iter().any(|b| {
        b.outputs().any(|c| {
            c.key == key && !c.is_excluded() && c.value.as_ref().map_or(true, |v| v == &value)
        })
    });
    if !producer_can {
        let mut required = PropertyMap::new();
        required.insert(key.clone(), value.clone());
        let props = pid.published_props().map.clone();
        let req = LinkRequest {
            required: Some(&required),
            allow_direct: false,
            ..LinkRequest::new(CapState::from_props(&props), &consumer.descriptor.caps)
        };
        Linker::new(&shared.registry, shared.config.max_chain_length)
            .resolve(&req)
            .map_err(|_| {
                Error::NotSupported(format!(
                    "no filter can deliver {}={} on '{}'",
                    key.name(),
                    value,
                    pid.name()
                ))
            })?;
    }
    tracing::debug!(pid = %pid.name(), key = %key.name(), "capability negotiation requested");
    pid.negotiate(key, value);
    producer.push_config(ConfigRequest::ReconfigureOutput {
        pid: pid.clone(),
        requester: inst.clone(),
    });
    Ok(())
}

/// The producer refused to reconfigure in place: route the PID through an adapter chain
///
/// The old connection drains what it already holds before being removed, so no packet
/// accepted before the renegotiation is lost.
pub(crate) fn insert_adapter(
    shared: &Arc<SessionShared>,
    pid: &Arc<PidShared>,
    requester: &Arc<PidInstance>,
    required: PropertyMap,
) {
    let Some(consumer) = requester.consumer.upgrade() else {
        return;
    };
    if required.is_empty() {
        return;
    }
    let props = pid.published_props().map.clone();
    let req = LinkRequest {
        required: Some(&required),
        allow_direct: false,
        ..LinkRequest::new(CapState::from_props(&props), &consumer.descriptor.caps)
    };
    let head = {
        let mut graph = shared.graph.write();
        let linker = Linker::new(&shared.registry, shared.config.max_chain_length);
        linker.resolve(&req).and_then(|chain| match chain.steps.first() {
            Some(step) => instantiate_step(shared, &mut graph, step, consumer.id, required.clone()),
            None => Err(Error::FilterNotFound("empty adapter chain".into())),
        })
    };
    match head {
        Ok(head) => {
            tracing::info!(pid = %pid.name(), adapter = %head.name, consumer = %consumer.name, "adapter inserted");
            pid.detach(requester, true);
            consumer.push_config(ConfigRequest::Remove(requester.clone()));
            let inst = attach(pid, &head);
            pid.connect(std::slice::from_ref(&inst));
            head.push_config(ConfigRequest::Connect(inst));
        }
        Err(e) => {
            tracing::warn!(pid = %pid.name(), consumer = %consumer.name, "adapter insertion failed: {}", e);
            shared.record_connect_error(FilterError::new(&consumer.name, &e));
        }
    }
}
