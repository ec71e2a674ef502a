//! Two-phase request/response exchange on one slot.
//!
//! The client claims the slot (`Idle → Busy`), writes the request, marks it
//! `Posted` and posts `request_ready`; the server consumes the post and reads
//! the request only if the slot is `Posted`. It writes the response and posts
//! `response_ready` after flipping the slot to `Answered`. The client reads the
//! response and hands the slot back (`Answered → Idle`).
//!
//! A client that gives up waiting flips `Posted → Abandoned` instead. Whichever
//! of the two compare-exchanges on `Posted` wins decides whether the response
//! is delivered, so a response is never posted to nobody and never read twice.
//! A `request_ready` post that finds the slot in any other state carries no
//! request and is answered with nothing.

use std::cell::Cell;
use std::time::{Duration, Instant};

use shm_primitives::futex::{futex_wait, futex_wake};

use crate::error::{HubError, Violation};
use crate::layout::{SlotRecord, SlotState};
use crate::protocol::{Request, RequestKind, Response};

/// Longest single sleep while waiting on a slot's state word.
const STATE_BACKOFF: Duration = Duration::from_millis(100);

/// Pending marker for a signal that carried no request.
const UNCLAIMED: u32 = u32::MAX;

/// Which kind of slot an endpoint is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// Shared by every client; contention is waited out.
    Control,
    /// Leased to one client; contention is a protocol violation.
    Data(u32),
}

// =============================================================================
// Client side
// =============================================================================

/// Client half of the rendezvous on one slot.
pub struct ClientEndpoint<'a> {
    slot: &'a SlotRecord,
    role: SlotRole,
    timeout: Option<Duration>,
}

impl<'a> ClientEndpoint<'a> {
    /// `timeout` bounds every wait in [`submit`](Self::submit); `None` waits forever.
    pub fn new(slot: &'a SlotRecord, role: SlotRole, timeout: Option<Duration>) -> Self {
        Self {
            slot,
            role,
            timeout,
        }
    }

    pub fn role(&self) -> SlotRole {
        self.role
    }

    /// Send one request and block for its response.
    ///
    /// Returns `PeerUnresponsive` if the deadline passes before the server
    /// answers; the slot is then left `Abandoned` for the server to clean up.
    pub fn submit(&self, request: &Request) -> Result<Response, HubError> {
        let deadline = self.timeout.and_then(|t| Instant::now().checked_add(t));
        let kind = request.kind();

        self.claim(deadline)?;
        self.slot.write_request(&request.encode());
        if let Err(observed) = self.slot.transition(SlotState::Busy, SlotState::Posted) {
            tracing::warn!(role = ?self.role, state = ?SlotState::from_u32(observed), "slot reclaimed while writing a request");
            return Err(Violation::SlotNotLeased.into());
        }
        self.slot.request_ready.post();
        tracing::trace!(role = ?self.role, ?kind, "request posted");

        if !self.slot.response_ready.wait_until(deadline) {
            match self.slot.transition(SlotState::Posted, SlotState::Abandoned) {
                Ok(()) => {
                    tracing::warn!(role = ?self.role, ?kind, "no response before deadline, abandoning slot");
                    return Err(HubError::PeerUnresponsive);
                }
                // Server already committed to answering; the post is on its way.
                Err(observed) if observed == SlotState::Answered as u32 => {
                    self.slot.response_ready.wait()
                }
                Err(observed) => {
                    tracing::warn!(role = ?self.role, state = ?SlotState::from_u32(observed), "slot reclaimed under a pending request");
                    return Err(HubError::PeerUnresponsive);
                }
            }
        }

        let response = Response::decode(self.slot.read_response(), kind);
        match response {
            Ok(Response::Finished) => self.release_after_finish(),
            _ => self.hand_back(),
        }
        response.map_err(HubError::from)
    }

    /// Take the slot for one exchange.
    fn claim(&self, deadline: Option<Instant>) -> Result<(), HubError> {
        loop {
            let observed = match self.slot.transition(SlotState::Idle, SlotState::Busy) {
                Ok(()) => return Ok(()),
                Err(observed) => observed,
            };

            if let SlotRole::Data(_) = self.role {
                let violation = match SlotState::from_u32(observed) {
                    Some(SlotState::Free) => Violation::SlotNotLeased,
                    _ => Violation::RequestOutstanding,
                };
                return Err(violation.into());
            }

            let mut nap = STATE_BACKOFF;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(HubError::PeerUnresponsive);
                }
                nap = nap.min(deadline - now);
            }
            // Spurious returns are fine: the loop re-reads the state.
            let _ = futex_wait(self.slot.state_word(), observed, Some(nap));
        }
    }

    /// `Answered → Idle`, waking the next control-slot claimant.
    fn hand_back(&self) {
        if self.slot.transition(SlotState::Answered, SlotState::Idle).is_err() {
            tracing::warn!(role = ?self.role, state = ?self.slot.state(), "slot changed state under an answered request");
            return;
        }
        if self.role == SlotRole::Control {
            futex_wake(self.slot.state_word(), 1);
        }
    }

    /// Tell the server the Finish response was consumed.
    ///
    /// Goes through the state word only, so nothing is left in the slot's
    /// semaphores for the next lease to find.
    fn release_after_finish(&self) {
        if self.slot.transition(SlotState::Answered, SlotState::Idle).is_ok() {
            futex_wake(self.slot.state_word(), 1);
        }
    }
}

// =============================================================================
// Server side
// =============================================================================

/// Outcome of one [`ServerEndpoint::serve_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// A well-formed request; answer it with [`ServerEndpoint::reply`].
    Request(Request),
    /// A signal arrived but the request cannot be used. Still needs a `reply`.
    Malformed(Violation),
    /// The client gave up before the request was read. No reply.
    Abandoned,
    /// Nothing arrived within the poll interval.
    Idle,
}

/// What happened to a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Response posted to a waiting client.
    Delivered,
    /// Client abandoned the request; nothing was posted.
    Abandoned,
    /// Slot was not in a claimed state; nothing was posted.
    Dropped,
}

/// Server half of the rendezvous on one slot.
///
/// Owned by exactly one worker thread; enforces `serve_once`/`reply` pairing.
pub struct ServerEndpoint<'a> {
    slot: &'a SlotRecord,
    role: SlotRole,
    /// Wire tag of the request awaiting a reply.
    pending: Cell<Option<u32>>,
}

impl<'a> ServerEndpoint<'a> {
    pub fn new(slot: &'a SlotRecord, role: SlotRole) -> Self {
        Self {
            slot,
            role,
            pending: Cell::new(None),
        }
    }

    pub fn role(&self) -> SlotRole {
        self.role
    }

    pub fn slot(&self) -> &'a SlotRecord {
        self.slot
    }

    /// Wait up to `poll` for the next request.
    pub fn serve_once(&self, poll: Duration) -> Result<Served, HubError> {
        if self.pending.get().is_some() {
            return Err(Violation::UnbalancedExchange.into());
        }
        if !self.slot.request_ready.wait_timeout(poll) {
            return Ok(Served::Idle);
        }

        match self.slot.state() {
            Some(SlotState::Posted) => {}
            Some(SlotState::Abandoned) => {
                if self.role == SlotRole::Control {
                    self.reopen_control();
                }
                return Ok(Served::Abandoned);
            }
            // Claimed but not yet written counts too: the payload is stale.
            state => {
                tracing::warn!(role = ?self.role, ?state, "request signal without a posted request");
                self.pending.set(Some(UNCLAIMED));
                return Ok(Served::Malformed(Violation::UnclaimedSignal));
            }
        }

        let wire = self.slot.read_request();
        self.pending.set(Some(wire.tag));
        Ok(match Request::decode(wire) {
            Ok(request) => {
                tracing::trace!(role = ?self.role, ?request, "request received");
                Served::Request(request)
            }
            Err(violation) => Served::Malformed(violation),
        })
    }

    /// Answer the request returned by the last `serve_once`.
    pub fn reply(&self, response: &Response) -> Result<Delivery, HubError> {
        let tag = self.pending.take().ok_or(Violation::UnbalancedExchange)?;
        if tag == UNCLAIMED {
            return Ok(Delivery::Dropped);
        }
        self.slot.write_response(&response.encode(tag));

        match self.slot.transition(SlotState::Posted, SlotState::Answered) {
            Ok(()) => {
                self.slot.response_ready.post();
                Ok(Delivery::Delivered)
            }
            Err(observed) if observed == SlotState::Abandoned as u32 => {
                if self.role == SlotRole::Control {
                    self.reopen_control();
                }
                Ok(Delivery::Abandoned)
            }
            Err(_) => Ok(Delivery::Dropped),
        }
    }

    /// After delivering a Finish response, wait for the client to hand the
    /// slot back. Returns `false` if it is still `Answered` at the deadline.
    pub fn await_release(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.slot.state() != Some(SlotState::Answered) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let nap = (deadline - now).min(STATE_BACKOFF);
            let _ = futex_wait(self.slot.state_word(), SlotState::Answered as u32, Some(nap));
        }
    }

    /// Whether a `reply` is owed.
    pub fn has_pending(&self) -> bool {
        self.pending.get().is_some()
    }

    fn reopen_control(&self) {
        self.slot.set_state(SlotState::Idle);
        futex_wake(self.slot.state_word(), 1);
    }
}

impl RequestKind {
    /// Whether this kind may be issued on a slot with the given role.
    pub fn allowed_on(self, role: SlotRole) -> bool {
        match role {
            SlotRole::Control => self == RequestKind::AllocateSlot,
            SlotRole::Data(_) => self != RequestKind::AllocateSlot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    const POLL: Duration = Duration::from_millis(10);

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Request,
        Response,
    }

    fn leased_slot() -> Arc<SlotRecord> {
        Arc::new(SlotRecord::new(SlotState::Idle))
    }

    /// Do by hand what `submit` does before it starts waiting.
    fn post_request(slot: &SlotRecord, request: &Request) {
        slot.transition(SlotState::Idle, SlotState::Busy).unwrap();
        slot.write_request(&request.encode());
        slot.transition(SlotState::Busy, SlotState::Posted).unwrap();
        slot.request_ready.post();
    }

    /// Serve `count` requests on `slot`, echoing CreateBuffer dimensions back.
    fn echo_server(slot: Arc<SlotRecord>, role: SlotRole, count: usize) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let server = ServerEndpoint::new(&slot, role);
            let mut served = 0;
            while served < count {
                match server.serve_once(POLL).unwrap() {
                    Served::Idle => continue,
                    Served::Request(Request::CreateBuffer { width, height }) => {
                        let response = Response::BufferCreated {
                            id: width as i32,
                            stride: height,
                        };
                        assert_eq!(server.reply(&response).unwrap(), Delivery::Delivered);
                    }
                    Served::Request(Request::AllocateSlot { pid }) => {
                        let response = Response::SlotAssigned { slot: pid };
                        assert_eq!(server.reply(&response).unwrap(), Delivery::Delivered);
                    }
                    other => panic!("unexpected {:?}", other),
                }
                served += 1;
            }
        })
    }

    #[test]
    fn requests_and_responses_alternate() {
        const ROUNDS: u32 = 200;
        let slot = leased_slot();
        let events = Arc::new(Mutex::new(Vec::new()));

        let server = {
            let slot = slot.clone();
            let events = events.clone();
            thread::spawn(move || {
                let endpoint = ServerEndpoint::new(&slot, SlotRole::Data(0));
                let mut served = 0;
                while served < ROUNDS {
                    let Served::Request(Request::CreateBuffer { width, height }) =
                        endpoint.serve_once(POLL).unwrap()
                    else {
                        continue;
                    };
                    // The signal was consumed exactly once.
                    assert_eq!(slot.request_ready.value(), 0);
                    events.lock().push(Event::Request);
                    let response = Response::BufferCreated {
                        id: width as i32,
                        stride: height,
                    };
                    events.lock().push(Event::Response);
                    endpoint.reply(&response).unwrap();
                    served += 1;
                }
            })
        };

        let client = ClientEndpoint::new(&slot, SlotRole::Data(0), Some(Duration::from_secs(5)));
        for i in 1..=ROUNDS {
            let response = client
                .submit(&Request::CreateBuffer {
                    width: i,
                    height: i * 2,
                })
                .unwrap();
            assert_eq!(
                response,
                Response::BufferCreated {
                    id: i as i32,
                    stride: i * 2
                }
            );
        }
        server.join().unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2 * ROUNDS as usize);
        for pair in events.chunks(2) {
            assert_eq!(pair, [Event::Request, Event::Response]);
        }
        assert_eq!(slot.state(), Some(SlotState::Idle));
        assert_eq!(slot.response_ready.value(), 0);
    }

    #[test]
    fn data_slot_contention_is_a_violation() {
        let slot = SlotRecord::new(SlotState::Busy);
        let client = ClientEndpoint::new(&slot, SlotRole::Data(3), None);
        let err = client.submit(&Request::GetBuffer { id: 1 }).unwrap_err();
        assert!(matches!(
            err,
            HubError::ProtocolViolation(Violation::RequestOutstanding)
        ));
        // No signal leaked.
        assert_eq!(slot.request_ready.value(), 0);
    }

    #[test]
    fn free_data_slot_is_not_leased() {
        let slot = SlotRecord::new(SlotState::Free);
        let client = ClientEndpoint::new(&slot, SlotRole::Data(0), None);
        let err = client.submit(&Request::Finish).unwrap_err();
        assert!(matches!(
            err,
            HubError::ProtocolViolation(Violation::SlotNotLeased)
        ));
    }

    #[test]
    fn timeout_abandons_and_server_sees_it() {
        let slot = SlotRecord::new(SlotState::Idle);
        let client = ClientEndpoint::new(&slot, SlotRole::Data(0), Some(Duration::from_millis(20)));
        let err = client.submit(&Request::GetBuffer { id: 5 }).unwrap_err();
        assert!(matches!(err, HubError::PeerUnresponsive));
        assert_eq!(slot.state(), Some(SlotState::Abandoned));

        let server = ServerEndpoint::new(&slot, SlotRole::Data(0));
        assert_eq!(server.serve_once(POLL).unwrap(), Served::Abandoned);
        assert!(!server.has_pending());
    }

    #[test]
    fn control_claim_times_out_behind_another_client() {
        let slot = SlotRecord::new(SlotState::Busy);
        let client = ClientEndpoint::new(&slot, SlotRole::Control, Some(Duration::from_millis(30)));
        let err = client.submit(&Request::AllocateSlot { pid: 1 }).unwrap_err();
        assert!(matches!(err, HubError::PeerUnresponsive));
        // The holder's claim is untouched and nothing was signalled.
        assert_eq!(slot.state(), Some(SlotState::Busy));
        assert_eq!(slot.request_ready.value(), 0);
    }

    #[test]
    fn answer_committed_before_timeout_is_still_delivered() {
        let slot = leased_slot();
        let client = {
            let slot = slot.clone();
            thread::spawn(move || {
                let client = ClientEndpoint::new(&slot, SlotRole::Data(0), Some(Duration::from_millis(200)));
                client.submit(&Request::GetBuffer { id: 9 })
            })
        };

        // Answer by hand so the post can be held back past the client's deadline.
        assert!(slot.request_ready.wait_timeout(Duration::from_secs(5)));
        assert_eq!(slot.state(), Some(SlotState::Posted));
        let response = Response::NotFound { id: 9 };
        slot.write_response(&response.encode(RequestKind::GetBuffer.tag()));
        slot.transition(SlotState::Posted, SlotState::Answered).unwrap();
        thread::sleep(Duration::from_millis(500));
        slot.response_ready.post();

        assert_eq!(client.join().unwrap().unwrap(), response);
        assert_eq!(slot.state(), Some(SlotState::Idle));
        assert_eq!(slot.response_ready.value(), 0);
    }

    #[test]
    fn reply_after_abandon_posts_nothing() {
        let slot = SlotRecord::new(SlotState::Idle);
        let server = ServerEndpoint::new(&slot, SlotRole::Control);

        post_request(&slot, &Request::AllocateSlot { pid: 7 });
        assert_eq!(
            server.serve_once(POLL).unwrap(),
            Served::Request(Request::AllocateSlot { pid: 7 })
        );

        slot.transition(SlotState::Posted, SlotState::Abandoned).unwrap();
        assert_eq!(
            server.reply(&Response::SlotAssigned { slot: 0 }).unwrap(),
            Delivery::Abandoned
        );
        assert_eq!(slot.response_ready.value(), 0);
        // The control slot is reopened for the next claimant.
        assert_eq!(slot.state(), Some(SlotState::Idle));
    }

    #[test]
    fn unbalanced_exchange_is_rejected() {
        let slot = SlotRecord::new(SlotState::Idle);
        let server = ServerEndpoint::new(&slot, SlotRole::Data(0));
        assert!(matches!(
            server.reply(&Response::Destroyed),
            Err(HubError::ProtocolViolation(Violation::UnbalancedExchange))
        ));

        post_request(&slot, &Request::DestroyBuffer { id: 1 });
        assert!(matches!(server.serve_once(POLL), Ok(Served::Request(_))));
        assert!(matches!(
            server.serve_once(POLL),
            Err(HubError::ProtocolViolation(Violation::UnbalancedExchange))
        ));
    }

    #[test]
    fn unknown_tag_is_malformed_and_rejected_in_band() {
        let slot = SlotRecord::new(SlotState::Idle);
        slot.transition(SlotState::Idle, SlotState::Busy).unwrap();
        slot.write_request(&crate::protocol::RequestWire {
            tag: 99,
            args: [0; 3],
        });
        slot.transition(SlotState::Busy, SlotState::Posted).unwrap();
        slot.request_ready.post();

        let server = ServerEndpoint::new(&slot, SlotRole::Data(1));
        let Served::Malformed(violation) = server.serve_once(POLL).unwrap() else {
            panic!("expected a malformed request");
        };
        assert_eq!(violation, Violation::UnknownTag);
        assert_eq!(
            server.reply(&Response::Rejected(violation)).unwrap(),
            Delivery::Delivered
        );
        assert_eq!(
            Response::decode(slot.read_response(), RequestKind::CreateBuffer),
            Ok(Response::Rejected(Violation::UnknownTag))
        );
    }

    #[test]
    fn unclaimed_signal_is_dropped() {
        let slot = SlotRecord::new(SlotState::Idle);
        slot.request_ready.post();
        let server = ServerEndpoint::new(&slot, SlotRole::Data(0));
        assert_eq!(
            server.serve_once(POLL).unwrap(),
            Served::Malformed(Violation::UnclaimedSignal)
        );
        assert_eq!(
            server
                .reply(&Response::Rejected(Violation::UnclaimedSignal))
                .unwrap(),
            Delivery::Dropped
        );
        assert_eq!(slot.response_ready.value(), 0);
    }

    #[test]
    fn surplus_signal_does_not_replay_the_previous_request() {
        let slot = SlotRecord::new(SlotState::Idle);
        let server = ServerEndpoint::new(&slot, SlotRole::Data(0));
        let first = Request::CreateBuffer {
            width: 640,
            height: 480,
        };

        post_request(&slot, &first);
        assert_eq!(server.serve_once(POLL).unwrap(), Served::Request(first));
        let created = Response::BufferCreated { id: 1, stride: 2560 };
        assert_eq!(server.reply(&created).unwrap(), Delivery::Delivered);
        assert!(slot.response_ready.wait_timeout(POLL));
        slot.transition(SlotState::Answered, SlotState::Idle).unwrap();

        // A stray post, then a claim whose payload is not written yet.
        slot.request_ready.post();
        slot.transition(SlotState::Idle, SlotState::Busy).unwrap();
        assert_eq!(
            server.serve_once(POLL).unwrap(),
            Served::Malformed(Violation::UnclaimedSignal)
        );
        assert_eq!(
            server.reply(&Response::Rejected(Violation::UnclaimedSignal)).unwrap(),
            Delivery::Dropped
        );
        assert_eq!(slot.state(), Some(SlotState::Busy));
        assert_eq!(slot.response_ready.value(), 0);

        // The claimant's own request is then served exactly once.
        let second = Request::GetBuffer { id: 1 };
        slot.write_request(&second.encode());
        slot.transition(SlotState::Busy, SlotState::Posted).unwrap();
        slot.request_ready.post();
        assert_eq!(server.serve_once(POLL).unwrap(), Served::Request(second));
        assert!(server.reply(&Response::NotFound { id: 1 }).is_ok());
        assert_eq!(slot.request_ready.value(), 0);
    }

    #[test]
    fn finish_release_leaves_no_signal_behind() {
        let slot = leased_slot();
        let server = {
            let slot = slot.clone();
            thread::spawn(move || {
                let endpoint = ServerEndpoint::new(&slot, SlotRole::Data(0));
                loop {
                    match endpoint.serve_once(POLL).unwrap() {
                        Served::Request(Request::Finish) => break,
                        Served::Idle => continue,
                        other => panic!("unexpected {:?}", other),
                    }
                }
                assert_eq!(endpoint.reply(&Response::Finished).unwrap(), Delivery::Delivered);
                assert!(endpoint.await_release(Duration::from_secs(5)));
            })
        };

        let client = ClientEndpoint::new(&slot, SlotRole::Data(0), Some(Duration::from_secs(5)));
        assert_eq!(client.submit(&Request::Finish).unwrap(), Response::Finished);
        server.join().unwrap();
        assert_eq!(slot.state(), Some(SlotState::Idle));
        assert_eq!(slot.request_ready.value(), 0);
        assert_eq!(slot.response_ready.value(), 0);
    }

    #[test]
    fn late_release_does_not_reach_the_next_lease() {
        let slot = SlotRecord::new(SlotState::Idle);
        let server = ServerEndpoint::new(&slot, SlotRole::Data(0));

        post_request(&slot, &Request::Finish);
        assert_eq!(server.serve_once(POLL).unwrap(), Served::Request(Request::Finish));
        assert_eq!(server.reply(&Response::Finished).unwrap(), Delivery::Delivered);
        assert!(slot.response_ready.wait_timeout(POLL));

        // Release deadline passes; the slot is reset and leased again.
        assert!(!server.await_release(Duration::ZERO));
        slot.set_state(SlotState::Free);
        slot.clear();
        slot.set_state(SlotState::Idle);

        // The previous owner's release arrives now.
        ClientEndpoint::new(&slot, SlotRole::Data(0), None).release_after_finish();
        assert_eq!(slot.request_ready.value(), 0);
        assert_eq!(slot.state(), Some(SlotState::Idle));
        assert_eq!(server.serve_once(POLL).unwrap(), Served::Idle);
    }

    #[test]
    fn control_slot_serializes_concurrent_clients() {
        const CLIENTS: u32 = 4;
        const PER_CLIENT: u32 = 25;
        let slot = leased_slot();
        let server = echo_server(slot.clone(), SlotRole::Control, (CLIENTS * PER_CLIENT) as usize);

        let clients: Vec<_> = (0..CLIENTS)
            .map(|c| {
                let slot = slot.clone();
                thread::spawn(move || {
                    let client =
                        ClientEndpoint::new(&slot, SlotRole::Control, Some(Duration::from_secs(10)));
                    for i in 0..PER_CLIENT {
                        let pid = c * 1000 + i;
                        let response = client.submit(&Request::AllocateSlot { pid }).unwrap();
                        assert_eq!(response, Response::SlotAssigned { slot: pid });
                    }
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }
        server.join().unwrap();
        assert_eq!(slot.state(), Some(SlotState::Idle));
    }

    #[test]
    fn request_kind_slot_roles() {
        assert!(RequestKind::AllocateSlot.allowed_on(SlotRole::Control));
        assert!(!RequestKind::CreateBuffer.allowed_on(SlotRole::Control));
        assert!(!RequestKind::AllocateSlot.allowed_on(SlotRole::Data(0)));
        assert!(RequestKind::Finish.allowed_on(SlotRole::Data(0)));
    }
}
