use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{LocalTrack, NegotiationOptions, PeerLink, SenderId};
use crate::error::SessionError;
use crate::events::{EventSink, Origin, PeerEvent, SignalingState};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription, SignalMessage};

/// Local view of whether an offer/answer exchange is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    Negotiating,
}

struct NegotiatorState {
    phase: NegotiationPhase,
    queued: VecDeque<NegotiationOptions>,
    in_flight: Option<NegotiationOptions>,
    offer_pending: bool,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    destroyed: bool,
}

/// Drives offer/answer for one [`PeerLink`].
///
/// At most one local offer is outstanding; further `renegotiate` requests
/// queue until the link reports a stable signaling state. Remote candidates
/// that arrive before a remote description are held back and applied in
/// arrival order once it is set.
pub struct Negotiator {
    link: Arc<dyn PeerLink>,
    sink: EventSink<PeerEvent>,
    state: Mutex<NegotiatorState>,
}

impl Negotiator {
    pub fn new(link: Arc<dyn PeerLink>, sink: EventSink<PeerEvent>) -> Arc<Self> {
        Arc::new(Self {
            link,
            sink,
            state: Mutex::new(NegotiatorState {
                phase: NegotiationPhase::Stable,
                queued: VecDeque::new(),
                in_flight: None,
                offer_pending: false,
                pending_candidates: VecDeque::new(),
                remote_description_set: false,
                destroyed: false,
            }),
        })
    }

    pub fn origin(&self) -> Origin {
        self.sink.origin()
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.state.lock().phase
    }

    pub fn queued_renegotiations(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending_candidates.len()
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description_set
    }

    /// Creates an offer and installs it as the local description.
    pub async fn create_offer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, SessionError> {
        let offer = self.link.create_offer(options).await?;
        self.link.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Creates an answer to the installed remote offer and installs it.
    pub async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Starts a local offer, or queues the request when one is already in
    /// flight. Returns whether an offer went out.
    pub async fn renegotiate(&self, options: NegotiationOptions) -> Result<bool, SessionError> {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Ok(false);
            }
            if state.phase == NegotiationPhase::Negotiating {
                state.queued.push_back(options);
                tracing::debug!(
                    target = "negotiator",
                    queued = state.queued.len(),
                    "negotiation in flight; deferring renegotiate"
                );
                return Ok(false);
            }
            state.phase = NegotiationPhase::Negotiating;
            state.in_flight = Some(options);
            state.offer_pending = true;
        }

        let result = self.create_offer(options).await;
        let mut state = self.state.lock();
        state.offer_pending = false;
        match result {
            Ok(offer) => {
                if state.destroyed {
                    return Ok(false);
                }
                drop(state);
                tracing::debug!(target = "negotiator", ice_restart = options.ice_restart, "offer created");
                self.sink.emit(PeerEvent::Outbound(SignalMessage::Offer(offer)));
                Ok(true)
            }
            Err(err) => {
                state.phase = NegotiationPhase::Stable;
                state.in_flight = None;
                let dropped = std::mem::take(&mut state.queued).len();
                tracing::warn!(target = "negotiator", error = %err, dropped, "offer failed; queued renegotiations cleared");
                Err(err)
            }
        }
    }

    /// Fed from the link's signaling-state callback. A return to stable ends
    /// the in-flight negotiation and starts the next queued one.
    pub async fn on_signaling_state(&self, signaling: SignalingState) -> Result<(), SessionError> {
        if signaling != SignalingState::Stable {
            return Ok(());
        }
        let next = {
            let mut state = self.state.lock();
            if state.destroyed || state.offer_pending {
                return Ok(());
            }
            state.phase = NegotiationPhase::Stable;
            state.in_flight = None;
            state.queued.pop_front()
        };
        match next {
            Some(options) => self.renegotiate(options).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Installs the remote description, then applies every buffered
    /// candidate in arrival order.
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SessionError> {
        self.link.set_remote_description(desc).await?;
        let mut applied = 0usize;
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending_candidates.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        state.remote_description_set = true;
                        break;
                    }
                }
            };
            if let Err(err) = self.link.add_ice_candidate(next).await {
                tracing::warn!(target = "negotiator", error = %err, "buffered candidate rejected");
            }
            applied += 1;
        }
        if applied > 0 {
            tracing::debug!(target = "negotiator", applied, "flushed buffered candidates");
        }
        Ok(())
    }

    /// Applies a remote candidate, or buffers it until a remote description
    /// exists. Returns `false` when buffered.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<bool, SessionError> {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Ok(false);
            }
            if !state.remote_description_set {
                state.pending_candidates.push_back(candidate);
                tracing::trace!(
                    target = "negotiator",
                    pending = state.pending_candidates.len(),
                    "buffering candidate"
                );
                return Ok(false);
            }
        }
        self.link.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Answers a remote offer. On collision with our own outstanding offer the
    /// polite side rolls back and answers; the other side keeps its offer and
    /// returns `None`.
    pub async fn handle_remote_offer(
        &self,
        offer: SessionDescription,
        polite: bool,
    ) -> Result<Option<SessionDescription>, SessionError> {
        let colliding = {
            let state = self.state.lock();
            state.offer_pending || self.link.signaling_state() == SignalingState::HaveLocalOffer
        };
        if colliding {
            if !polite {
                tracing::debug!(target = "negotiator", "ignoring colliding remote offer");
                return Ok(None);
            }
            tracing::debug!(target = "negotiator", "rolling back local offer for remote offer");
            self.link
                .set_local_description(SessionDescription::rollback())
                .await?;
            let mut state = self.state.lock();
            if let Some(options) = state.in_flight.take() {
                state.queued.push_front(options);
            }
            state.phase = NegotiationPhase::Stable;
        }

        self.set_remote_description(offer).await?;
        let answer = self.create_answer().await?;
        self.sink
            .emit(PeerEvent::Outbound(SignalMessage::Answer(answer.clone())));
        Ok(Some(answer))
    }

    pub async fn handle_remote_answer(&self, answer: SessionDescription) -> Result<(), SessionError> {
        if answer.kind != SdpKind::Answer && answer.kind != SdpKind::Pranswer {
            return Err(SessionError::negotiation(
                "set_remote_description",
                "expected an answer",
            ));
        }
        self.set_remote_description(answer).await
    }

    pub async fn add_track(&self, track: LocalTrack) -> Result<SenderId, SessionError> {
        self.link.add_track(track).await
    }

    pub async fn remove_track(&self, sender: SenderId) -> Result<(), SessionError> {
        self.link.remove_track(sender).await
    }

    /// Drops queued work and closes the link in the background.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.queued.clear();
            state.pending_candidates.clear();
            state.in_flight = None;
        }
        let link = self.link.clone();
        tokio::spawn(async move { link.close().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelOptions;
    use crate::events::Stamped;
    use crate::peer::DataChannelHandle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        signaling: Mutex<Option<SignalingState>>,
        fail_offers: AtomicBool,
    }

    #[async_trait]
    impl PeerLink for Recorder {
        async fn create_offer(
            &self,
            _options: NegotiationOptions,
        ) -> Result<SessionDescription, SessionError> {
            self.calls.lock().push("create_offer".into());
            if self.fail_offers.load(Ordering::SeqCst) {
                return Err(SessionError::negotiation("create_offer", "no transceivers"));
            }
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
            self.calls.lock().push("create_answer".into());
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), SessionError> {
            self.calls.lock().push(format!("local:{:?}", desc.kind));
            *self.signaling.lock() = Some(match desc.kind {
                SdpKind::Offer => SignalingState::HaveLocalOffer,
                _ => SignalingState::Stable,
            });
            Ok(())
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), SessionError> {
            self.calls.lock().push(format!("remote:{:?}", desc.kind));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
            self.calls.lock().push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn create_data_channel(
            &self,
            label: &str,
            _options: ChannelOptions,
        ) -> Result<Arc<dyn DataChannelHandle>, SessionError> {
            Err(SessionError::ChannelCreateFailed {
                label: label.into(),
                reason: "unsupported".into(),
            })
        }

        async fn add_track(&self, _track: LocalTrack) -> Result<SenderId, SessionError> {
            Ok(SenderId(1))
        }

        async fn remove_track(&self, _sender: SenderId) -> Result<(), SessionError> {
            Ok(())
        }

        fn signaling_state(&self) -> SignalingState {
            self.signaling.lock().unwrap_or(SignalingState::Stable)
        }

        async fn close(&self) {}
    }

    fn negotiator() -> (
        Arc<Negotiator>,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<Stamped<PeerEvent>>,
    ) {
        let link = Arc::new(Recorder::default());
        let (sink, rx) = EventSink::channel();
        (Negotiator::new(link.clone(), sink), link, rx)
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description() {
        let (negotiator, link, _rx) = negotiator();
        for n in 0..3 {
            let applied = negotiator
                .add_ice_candidate(IceCandidate::new(format!("c{n}")))
                .await
                .unwrap();
            assert!(!applied);
        }
        assert_eq!(negotiator.pending_candidates(), 3);

        negotiator
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(negotiator.pending_candidates(), 0);
        assert_eq!(
            link.calls.lock().clone(),
            vec!["remote:Answer", "candidate:c0", "candidate:c1", "candidate:c2"]
        );

        assert!(negotiator
            .add_ice_candidate(IceCandidate::new("late"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn second_renegotiate_waits_for_stable() {
        let (negotiator, link, mut rx) = negotiator();
        assert!(negotiator.renegotiate(NegotiationOptions::default()).await.unwrap());
        assert!(!negotiator.renegotiate(NegotiationOptions::default()).await.unwrap());
        assert_eq!(negotiator.phase(), NegotiationPhase::Negotiating);
        assert_eq!(negotiator.queued_renegotiations(), 1);

        let offers = link
            .calls
            .lock()
            .iter()
            .filter(|call| *call == "create_offer")
            .count();
        assert_eq!(offers, 1);

        negotiator
            .on_signaling_state(SignalingState::Stable)
            .await
            .unwrap();
        assert_eq!(negotiator.queued_renegotiations(), 0);
        assert_eq!(negotiator.phase(), NegotiationPhase::Negotiating);

        let mut outbound = 0;
        while let Ok(stamped) = rx.try_recv() {
            if matches!(stamped.event, PeerEvent::Outbound(SignalMessage::Offer(_))) {
                outbound += 1;
            }
        }
        assert_eq!(outbound, 2);
    }

    #[tokio::test]
    async fn failed_offer_clears_queued_renegotiations() {
        let (negotiator, link, _rx) = negotiator();
        assert!(negotiator.renegotiate(NegotiationOptions::default()).await.unwrap());
        negotiator.renegotiate(NegotiationOptions::default()).await.unwrap();
        negotiator.renegotiate(NegotiationOptions::default()).await.unwrap();
        assert_eq!(negotiator.queued_renegotiations(), 2);

        link.fail_offers.store(true, Ordering::SeqCst);
        let err = negotiator
            .on_signaling_state(SignalingState::Stable)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NegotiationFailed { stage: "create_offer", .. }));
        assert_eq!(negotiator.queued_renegotiations(), 0);
        assert_eq!(negotiator.phase(), NegotiationPhase::Stable);

        link.fail_offers.store(false, Ordering::SeqCst);
        assert!(negotiator.renegotiate(NegotiationOptions::default()).await.unwrap());
    }

    #[tokio::test]
    async fn polite_side_rolls_back_on_collision() {
        let (negotiator, link, _rx) = negotiator();
        negotiator.renegotiate(NegotiationOptions::default()).await.unwrap();

        let answer = negotiator
            .handle_remote_offer(SessionDescription::offer("remote"), true)
            .await
            .unwrap();
        assert!(answer.is_some());
        let calls = link.calls.lock().clone();
        assert!(calls.contains(&"local:Rollback".to_string()));
        assert_eq!(negotiator.queued_renegotiations(), 1);
    }

    #[tokio::test]
    async fn impolite_side_ignores_collision() {
        let (negotiator, _link, _rx) = negotiator();
        negotiator.renegotiate(NegotiationOptions::default()).await.unwrap();
        let answer = negotiator
            .handle_remote_offer(SessionDescription::offer("remote"), false)
            .await
            .unwrap();
        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn destroyed_negotiator_stops_offering() {
        let (negotiator, link, _rx) = negotiator();
        negotiator.destroy();
        assert!(!negotiator.renegotiate(NegotiationOptions::default()).await.unwrap());
        assert!(link.calls.lock().is_empty());
    }
}
