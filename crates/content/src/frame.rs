//! The frame controller: sole owner of the embedded frame's attachment.
//!
//! Yielding physically removes the frame from the document (hiding it is
//! not enough, some interference happens at the attachment level). Removal
//! leaves an anchor comment at the frame's former position so resuming puts
//! it back exactly there. Anything that notices the page tampering with the
//! frame must go through [`FrameController::heal`], never reinsert it
//! directly.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use resilink_core::bus::{EventBus, FramePort};
use resilink_core::context::TabId;
use resilink_core::event::BusEvent;
use resilink_core::message::FrameMessage;
use resilink_core::yield_state::{YieldState, reasons};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dom::{DomError, DomOps, NodeId, SharedDom};
use crate::machine::YieldMachine;

const ANCHOR_LABEL: &str = "resilink frame anchor";
const PLACEHOLDER_TAG: &str = "resilink-yield-placeholder";

#[derive(Debug, Default)]
struct Attachment {
    machine: YieldMachine,
    frame: Option<NodeId>,
    container: Option<NodeId>,
    anchor: Option<NodeId>,
    /// Parent the frame was detached from; fallback when the anchor is gone.
    ghost_parent: Option<NodeId>,
    placeholder: Option<NodeId>,
    sidebar_visible: bool,
    /// Time of the last published snapshot; strictly increasing.
    stamped: Option<DateTime<Utc>>,
}

pub struct FrameController<D: DomOps> {
    tab: TabId,
    dom: SharedDom<D>,
    bus: Arc<dyn EventBus>,
    port: Arc<dyn FramePort>,
    inner: Mutex<Attachment>,
}

impl<D: DomOps> FrameController<D> {
    pub fn new(
        tab: TabId,
        dom: SharedDom<D>,
        bus: Arc<dyn EventBus>,
        port: Arc<dyn FramePort>,
    ) -> Self {
        Self {
            tab,
            dom,
            bus,
            port,
            inner: Mutex::new(Attachment::default()),
        }
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    /// Finish construction: attach `container` to the document and `frame`
    /// inside it. If a yield was requested before construction completed,
    /// the frame is detached right away.
    ///
    /// The freshly loaded frame is told the current state with
    /// `IFRAME_READY`.
    pub async fn mount(&self, container: NodeId, frame: NodeId) -> Result<YieldState, DomError> {
        let (state, at) = {
            let mut inner = self.inner.lock().await;
            let mut dom = self.dom.lock().await;

            if !dom.is_connected(container) {
                let root = dom.root();
                dom.append_child(root, container)?;
            }
            if dom.parent_of(frame) != Some(container) {
                dom.append_child(container, frame)?;
            }
            inner.frame = Some(frame);
            inner.container = Some(container);

            if inner.machine.is_yielding() {
                show_placeholder(&mut inner, &mut *dom);
                detach(&mut inner, &mut *dom, reasons::INIT_WHILE_YIELDING);
            }
            (snapshot(&inner, &*dom), stamp(&mut inner))
        };

        debug!(tab_id = %self.tab, frame = %frame, state = %state.state, "Frame mounted");
        self.post(&state, reasons::IFRAME_READY, at);
        Ok(state)
    }

    /// The frame (re)loaded and wants the current state.
    pub async fn frame_ready(&self) -> YieldState {
        let (state, at) = {
            let mut inner = self.inner.lock().await;
            let dom = self.dom.lock().await;
            (snapshot(&inner, &*dom), stamp(&mut inner))
        };
        self.post(&state, reasons::IFRAME_READY, at);
        state
    }

    /// Enter YIELDING: show the placeholder, detach the frame behind an
    /// anchor and broadcast. A no-op when already yielding.
    pub async fn suspend(&self, reason: &str) -> YieldState {
        let (state, at) = {
            let mut inner = self.inner.lock().await;
            let mut dom = self.dom.lock().await;
            if !inner.machine.suspend(reason).changed() {
                return snapshot(&inner, &*dom);
            }

            show_placeholder(&mut inner, &mut *dom);
            if !detach(&mut inner, &mut *dom, reason) {
                info!(tab_id = %self.tab, reason, "Yielding before the frame is attached");
            }
            (snapshot(&inner, &*dom), stamp(&mut inner))
        };

        info!(tab_id = %self.tab, reason, "State -> YIELDING");
        self.publish(&state, reason, at);
        state
    }

    /// Enter ACTIVE: hide the placeholder, reattach the frame at its anchor
    /// and notify both the bus and the frame itself, which may have missed
    /// the broadcast while detached.
    pub async fn resume(&self, reason: &str) -> YieldState {
        let (state, at) = {
            let mut inner = self.inner.lock().await;
            let mut dom = self.dom.lock().await;
            if !inner.machine.resume(reason).changed() {
                return snapshot(&inner, &*dom);
            }

            hide_placeholder(&inner, &mut *dom);
            restore(&mut inner, &mut *dom, reason);
            (snapshot(&inner, &*dom), stamp(&mut inner))
        };

        info!(tab_id = %self.tab, reason, "State -> ACTIVE");
        self.publish(&state, reason, at);
        self.post(&state, reason, at);
        state
    }

    fn publish(&self, state: &YieldState, reason: &str, at: DateTime<Utc>) {
        self.bus.broadcast(BusEvent::YieldStateChanged {
            tab_id: self.tab,
            state: state.clone(),
            reason: reason.to_string(),
            timestamp: at,
        });
    }

    fn post(&self, state: &YieldState, reason: &str, at: DateTime<Utc>) {
        self.port.post(
            self.tab,
            FrameMessage::YieldStateChanged {
                state: state.clone(),
                reason: reason.to_string(),
                timestamp: at,
            },
        );
    }

    pub async fn set(&self, enable: bool, reason: &str) -> YieldState {
        if enable {
            self.suspend(reason).await
        } else {
            self.resume(reason).await
        }
    }

    pub async fn toggle(&self, reason: &str) -> YieldState {
        let enable = !self.inner.lock().await.machine.is_yielding();
        self.set(enable, reason).await
    }

    /// The placeholder's resume action.
    pub async fn placeholder_resume(&self) -> YieldState {
        self.resume(reasons::PLACEHOLDER_RESUME_BUTTON).await
    }

    pub async fn state(&self) -> YieldState {
        let inner = self.inner.lock().await;
        let dom = self.dom.lock().await;
        snapshot(&inner, &*dom)
    }

    pub async fn set_sidebar_visible(&self, visible: bool) {
        self.inner.lock().await.sidebar_visible = visible;
    }

    pub async fn frame(&self) -> Option<NodeId> {
        self.inner.lock().await.frame
    }

    pub async fn container(&self) -> Option<NodeId> {
        self.inner.lock().await.container
    }

    pub async fn anchor(&self) -> Option<NodeId> {
        self.inner.lock().await.anchor
    }

    pub async fn placeholder(&self) -> Option<NodeId> {
        self.inner.lock().await.placeholder
    }

    /// Whether the document agrees with the current mode.
    pub async fn is_consistent(&self) -> bool {
        let inner = self.inner.lock().await;
        let dom = self.dom.lock().await;

        let (Some(frame), Some(container)) = (inner.frame, inner.container) else {
            return true;
        };
        if !dom.is_connected(container) {
            return false;
        }
        dom.is_connected(frame) != inner.machine.is_yielding()
    }

    /// Restore the attachment the current mode calls for after the page
    /// removed or reinserted our nodes. Returns whether anything changed.
    pub async fn heal(&self, reason: &str) -> Result<bool, DomError> {
        let mut inner = self.inner.lock().await;
        let mut dom = self.dom.lock().await;

        let (Some(frame), Some(container)) = (inner.frame, inner.container) else {
            return Ok(false);
        };
        let mut repaired = false;

        if !dom.is_connected(container) {
            let root = dom.root();
            dom.append_child(root, container)?;
            repaired = true;
        }

        if inner.machine.is_yielding() {
            if dom.is_connected(frame) {
                show_placeholder(&mut inner, &mut *dom);
                detach(&mut inner, &mut *dom, reason);
                repaired = true;
            }
        } else if !dom.is_connected(frame) {
            if !restore(&mut inner, &mut *dom, reason) {
                dom.append_child(container, frame)?;
            }
            repaired = true;
        }

        if repaired {
            warn!(tab_id = %self.tab, reason, state = %inner.machine.mode(), "Frame attachment repaired");
        }
        Ok(repaired)
    }
}

/// Snapshot times never repeat or go backwards, so receivers can order
/// them even when the wall clock does.
fn stamp(inner: &mut Attachment) -> DateTime<Utc> {
    let now = Utc::now();
    let at = match inner.stamped {
        Some(previous) if now <= previous => previous + TimeDelta::nanoseconds(1),
        _ => now,
    };
    inner.stamped = Some(at);
    at
}

fn snapshot<D: DomOps>(inner: &Attachment, dom: &D) -> YieldState {
    YieldState {
        state: inner.machine.mode(),
        ready: inner.frame.is_some(),
        frame_present: inner.frame.is_some_and(|f| dom.is_connected(f)),
        sidebar_visible: inner.sidebar_visible,
        reason: inner.machine.reason().map(str::to_string),
    }
}

fn show_placeholder<D: DomOps>(inner: &mut Attachment, dom: &mut D) {
    let placeholder = *inner
        .placeholder
        .get_or_insert_with(|| dom.create_element(PLACEHOLDER_TAG));

    if !dom.is_connected(placeholder) {
        let root = dom.root();
        if let Err(e) = dom.append_child(root, placeholder) {
            warn!(error = %e, "Placeholder could not be attached");
        }
    }
    if let Err(e) = dom.set_hidden(placeholder, false) {
        warn!(error = %e, "Placeholder could not be shown");
    }
}

fn hide_placeholder<D: DomOps>(inner: &Attachment, dom: &mut D) {
    if let Some(placeholder) = inner.placeholder {
        if let Err(e) = dom.set_hidden(placeholder, true) {
            warn!(error = %e, "Placeholder could not be hidden");
        }
    }
}

/// Remove the frame, leaving the anchor in its place.
fn detach<D: DomOps>(inner: &mut Attachment, dom: &mut D, reason: &str) -> bool {
    let Some(frame) = inner.frame else {
        return false;
    };
    if !dom.is_connected(frame) {
        return false;
    }
    let Some(parent) = dom.parent_of(frame) else {
        return false;
    };

    let anchor = *inner
        .anchor
        .get_or_insert_with(|| dom.create_anchor(ANCHOR_LABEL));
    if let Err(e) = dom.insert_before(parent, anchor, frame) {
        warn!(error = %e, "Anchor could not be placed, resume will append");
    }

    dom.remove(frame);
    inner.ghost_parent = Some(parent);
    debug!(reason, "Frame removed for yielding");
    true
}

/// Put the frame back before the anchor, or at the end of its former
/// parent when the anchor is gone. Always clears the anchor.
fn restore<D: DomOps>(inner: &mut Attachment, dom: &mut D, reason: &str) -> bool {
    let anchor_parent = inner.anchor.and_then(|a| dom.parent_of(a));
    let fallback = anchor_parent.or(inner.ghost_parent);

    let restored = match (inner.frame, fallback) {
        (Some(frame), Some(parent)) if !dom.is_connected(frame) && dom.is_connected(parent) => {
            let result = match (inner.anchor, anchor_parent) {
                (Some(anchor), Some(_)) => dom.insert_before(parent, frame, anchor),
                _ => dom.append_child(parent, frame),
            };
            match result {
                Ok(()) => {
                    debug!(reason, "Frame restored");
                    true
                }
                Err(e) => {
                    warn!(reason, error = %e, "Frame could not be restored");
                    false
                }
            }
        }
        _ => false,
    };

    if let Some(anchor) = inner.anchor {
        dom.remove(anchor);
    }
    inner.ghost_parent = None;
    restored
}
