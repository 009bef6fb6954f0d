//! Browser-backed [`DatagramChannel`], wrapping `RTCPeerConnection` and a
//! single `"flux-transfer"` `RTCDataChannel` via `web-sys`. Event callbacks
//! push into a shared, mutex-guarded queue that [`WebRtcChannel::poll_events`]
//! drains. SDP negotiation (`create_offer`/`create_answer`/
//! `set_local_description`) is promise-based, so it runs as a `spawn_local`
//! task awaited through `wasm_bindgen_futures::JsFuture` — the same idiom
//! this adapter was generalized from (see the teacher's `create_offer`/
//! `accept_offer` in `webrtc_transport.rs`) — with the result surfacing
//! later as a `Signal` event rather than being returned directly, since
//! `DatagramChannel::signal`/`create` are synchronous. Registered closures
//! are leaked with `.forget()`, since each fills a JS callback slot for the
//! lifetime of the peer connection and is never explicitly torn down.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use send_wrapper::SendWrapper;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::{spawn_local, JsFuture};
use web_sys::{
    MessageEvent, RtcConfiguration, RtcDataChannel, RtcDataChannelEvent, RtcDataChannelInit,
    RtcDataChannelState, RtcDataChannelType, RtcIceCandidate, RtcIceCandidateInit,
    RtcIceGatheringState, RtcPeerConnection, RtcPeerConnectionIceEvent, RtcSdpType,
    RtcSessionDescriptionInit,
};

use super::{
    check_message_size, ChannelEvent, DatagramChannel, DatagramChannelFactory, DatagramConfig,
    SignalPayload, CHANNEL_LABEL,
};
use crate::error::{Error, Result};

/// Builds browser-backed [`WebRtcChannel`]s. The factory itself holds no
/// state beyond what [`DatagramConfig`] already carries.
#[derive(Debug, Clone, Default)]
pub struct WasmChannelFactory;

impl DatagramChannelFactory for WasmChannelFactory {
    type Channel = WebRtcChannel;

    fn create(&self, initiator: bool, config: &DatagramConfig) -> Result<WebRtcChannel> {
        WebRtcChannel::create(initiator, config)
    }
}

struct Shared {
    events: VecDeque<ChannelEvent>,
    remote_description_set: bool,
    pending_candidates: VecDeque<SignalPayload>,
    connected: bool,
}

/// Slot the negotiated data channel lands in. Populated eagerly for the
/// initiator (it opens the channel itself); populated later, from
/// `ondatachannel`, for the non-initiator.
type ChannelSlot = Rc<RefCell<Option<RtcDataChannel>>>;

/// A live WebRTC peer connection plus its single data channel.
pub struct WebRtcChannel {
    peer: SendWrapper<RtcPeerConnection>,
    channel: SendWrapper<ChannelSlot>,
    shared: Arc<Mutex<Shared>>,
    trickle_ice: bool,
}

impl WebRtcChannel {
    /// Builds a peer endpoint (§4.7). In initiator mode, opens the
    /// `"flux-transfer"` data channel and starts `create_offer`
    /// immediately. In non-initiator mode, the channel arrives later via
    /// `ondatachannel`, and the answer is produced once `signal` feeds in
    /// the remote offer.
    pub fn create(initiator: bool, config: &DatagramConfig) -> Result<Self> {
        let peer = build_peer_connection(config)?;

        let shared = Arc::new(Mutex::new(Shared {
            events: VecDeque::new(),
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            connected: false,
        }));
        let channel_slot: ChannelSlot = Rc::new(RefCell::new(None));

        install_ice_candidate_handler(&peer, shared.clone(), config.trickle_ice);
        install_ice_gathering_handler(&peer, shared.clone(), config.trickle_ice);

        if initiator {
            let dc_init = RtcDataChannelInit::new();
            dc_init.set_ordered(true);
            let channel = peer.create_data_channel_with_data_channel_dict(CHANNEL_LABEL, &dc_init);
            attach_channel_handlers(&channel, shared.clone());
            *channel_slot.borrow_mut() = Some(channel);

            let peer_for_offer = (*peer).clone();
            let shared_for_offer = shared.clone();
            let trickle_ice = config.trickle_ice;
            spawn_local(async move {
                if let Err(e) = negotiate_offer(&peer_for_offer, &shared_for_offer, trickle_ice).await {
                    shared_for_offer.lock().unwrap().events.push_back(ChannelEvent::Error(e));
                }
            });
        } else {
            let shared_for_dc = shared.clone();
            let channel_slot_for_dc = channel_slot.clone();
            let on_data_channel = Closure::wrap(Box::new(move |event: RtcDataChannelEvent| {
                let channel = event.channel();
                attach_channel_handlers(&channel, shared_for_dc.clone());
                *channel_slot_for_dc.borrow_mut() = Some(channel);
            }) as Box<dyn FnMut(RtcDataChannelEvent)>);
            peer.set_ondatachannel(Some(on_data_channel.as_ref().unchecked_ref()));
            on_data_channel.forget();
        }

        Ok(Self {
            peer: SendWrapper::new(peer),
            channel: SendWrapper::new(channel_slot),
            shared,
            trickle_ice: config.trickle_ice,
        })
    }

    fn apply_candidate(&self, candidate: &str) -> Result<()> {
        let init = RtcIceCandidateInit::new(candidate);
        let ice = RtcIceCandidate::new(&init).map_err(|e| Error::ChannelError(format!("{e:?}")))?;
        let _ = self.peer.add_ice_candidate_with_opt_rtc_ice_candidate(Some(&ice));
        Ok(())
    }

    /// Applies a remote offer and produces the answer — the non-initiator
    /// half of §4.7's exchange. Runs in the background since the
    /// negotiation steps are promise-based; the resulting
    /// `Signal(Answer{..})` (or, with trickle disabled, the
    /// gathering-complete handler) surfaces through `poll_events` once
    /// ready.
    fn handle_remote_offer(&self, sdp: String) {
        let peer = (*self.peer).clone();
        let shared = self.shared.clone();
        let trickle_ice = self.trickle_ice;
        spawn_local(async move {
            if let Err(e) = negotiate_answer(&peer, &shared, &sdp, trickle_ice).await {
                shared.lock().unwrap().events.push_back(ChannelEvent::Error(e));
            }
        });
    }

    /// Applies a remote answer — the initiator's half, completing the
    /// exchange this side started in `create()`.
    fn handle_remote_answer(&self, sdp: String) {
        let peer = (*self.peer).clone();
        let shared = self.shared.clone();
        spawn_local(async move {
            if let Err(e) = set_remote_description(&peer, RtcSdpType::Answer, &sdp).await {
                shared.lock().unwrap().events.push_back(ChannelEvent::Error(e));
                return;
            }
            replay_pending_candidates(&peer, &shared);
        });
    }
}

impl DatagramChannel for WebRtcChannel {
    fn signal(&mut self, payload: SignalPayload) -> Result<()> {
        match payload {
            SignalPayload::Offer { sdp } => {
                self.handle_remote_offer(sdp);
                Ok(())
            }
            SignalPayload::Answer { sdp } => {
                self.handle_remote_answer(sdp);
                Ok(())
            }
            SignalPayload::Candidate { candidate } => {
                let remote_set = self.shared.lock().unwrap().remote_description_set;
                if remote_set {
                    self.apply_candidate(&candidate)
                } else {
                    self.shared
                        .lock()
                        .unwrap()
                        .pending_candidates
                        .push_back(SignalPayload::Candidate { candidate });
                    Ok(())
                }
            }
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        check_message_size(bytes)?;
        let channel_ref = self.channel.borrow();
        let Some(channel) = channel_ref.as_ref() else {
            return Err(Error::NotConnected);
        };
        if channel.ready_state() != RtcDataChannelState::Open {
            return Err(Error::NotConnected);
        }
        channel
            .send_with_u8_array(bytes)
            .map_err(|e| Error::ChannelError(format!("{e:?}")))
    }

    fn poll_events(&mut self) -> Vec<ChannelEvent> {
        self.shared.lock().unwrap().events.drain(..).collect()
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().connected
    }
}

// ── Peer construction ───────────────────────────────────────────────────

fn build_peer_connection(config: &DatagramConfig) -> Result<RtcPeerConnection> {
    let rtc_config = RtcConfiguration::new();
    let ice_servers = js_sys::Array::new();
    for url in &config.ice_servers {
        let server = js_sys::Object::new();
        js_sys::Reflect::set(&server, &"urls".into(), &url.as_str().into())
            .map_err(|_| Error::ChannelError("failed to build ICE server entry".into()))?;
        ice_servers.push(&server);
    }
    rtc_config.set_ice_servers(&ice_servers);
    RtcPeerConnection::new_with_configuration(&rtc_config)
        .map_err(|e| Error::ChannelError(format!("{e:?}")))
}

/// Wires up the channel-level callbacks (message/open/close/error) once a
/// `RtcDataChannel` exists, whether created eagerly (initiator) or handed
/// in via `ondatachannel` (non-initiator).
fn attach_channel_handlers(channel: &RtcDataChannel, shared: Arc<Mutex<Shared>>) {
    channel.set_binary_type(RtcDataChannelType::Arraybuffer);

    let shared_msg = shared.clone();
    let on_message = Closure::wrap(Box::new(move |event: MessageEvent| {
        if let Ok(buf) = event.data().dyn_into::<js_sys::ArrayBuffer>() {
            let bytes = js_sys::Uint8Array::new(&buf).to_vec();
            shared_msg.lock().unwrap().events.push_back(ChannelEvent::Message(bytes));
        }
    }) as Box<dyn FnMut(MessageEvent)>);
    channel.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
    on_message.forget();

    let shared_open = shared.clone();
    let on_open = Closure::wrap(Box::new(move |_: web_sys::Event| {
        let mut s = shared_open.lock().unwrap();
        s.connected = true;
        s.events.push_back(ChannelEvent::Connected);
    }) as Box<dyn FnMut(web_sys::Event)>);
    channel.set_onopen(Some(on_open.as_ref().unchecked_ref()));
    on_open.forget();

    let shared_close = shared.clone();
    let on_close = Closure::wrap(Box::new(move |_: web_sys::Event| {
        let mut s = shared_close.lock().unwrap();
        s.connected = false;
        s.events.push_back(ChannelEvent::Disconnected);
    }) as Box<dyn FnMut(web_sys::Event)>);
    channel.set_onclose(Some(on_close.as_ref().unchecked_ref()));
    on_close.forget();

    let shared_err = shared.clone();
    let on_error = Closure::wrap(Box::new(move |_: web_sys::Event| {
        shared_err
            .lock()
            .unwrap()
            .events
            .push_back(ChannelEvent::Error("data channel error".to_string()));
    }) as Box<dyn FnMut(web_sys::Event)>);
    channel.set_onerror(Some(on_error.as_ref().unchecked_ref()));
    on_error.forget();
}

/// Registers the ICE candidate handler. With trickle enabled (default),
/// each candidate is relayed immediately as it's discovered. With trickle
/// disabled, candidates stay embedded in the local description and are
/// relayed only once gathering completes — see
/// [`install_ice_gathering_handler`].
fn install_ice_candidate_handler(peer: &RtcPeerConnection, shared: Arc<Mutex<Shared>>, trickle_ice: bool) {
    let on_ice_candidate = Closure::wrap(Box::new(move |event: RtcPeerConnectionIceEvent| {
        if !trickle_ice {
            return;
        }
        if let Some(candidate) = event.candidate() {
            shared.lock().unwrap().events.push_back(ChannelEvent::Signal(SignalPayload::Candidate {
                candidate: candidate.candidate(),
            }));
        }
    }) as Box<dyn FnMut(RtcPeerConnectionIceEvent)>);
    peer.set_onicecandidate(Some(on_ice_candidate.as_ref().unchecked_ref()));
    on_ice_candidate.forget();
}

/// With trickle disabled, §4.7 defers emission of the local description
/// until ICE gathering finishes. `negotiate_offer`/`negotiate_answer` still
/// call `set_local_description` either way; this handler is the one that
/// actually emits the `Signal` once `ice_gathering_state()` reaches
/// `Complete`. A no-op when trickle is enabled, since emission happens
/// inline right after `set_local_description` instead.
fn install_ice_gathering_handler(peer: &RtcPeerConnection, shared: Arc<Mutex<Shared>>, trickle_ice: bool) {
    if trickle_ice {
        return;
    }
    let peer_for_state = peer.clone();
    let on_gathering_state_change = Closure::wrap(Box::new(move |_: web_sys::Event| {
        if peer_for_state.ice_gathering_state() == RtcIceGatheringState::Complete {
            emit_local_description(&peer_for_state, &shared);
        }
    }) as Box<dyn FnMut(web_sys::Event)>);
    peer.set_onicegatheringstatechange(Some(on_gathering_state_change.as_ref().unchecked_ref()));
    on_gathering_state_change.forget();
}

/// Pushes the peer's current local description as a `Signal` event, tagged
/// `Offer` or `Answer` to match its actual `RtcSdpType` — never guessed
/// from the SDP content.
fn emit_local_description(peer: &RtcPeerConnection, shared: &Arc<Mutex<Shared>>) {
    let Some(desc) = peer.local_description() else { return };
    let sdp = desc.sdp();
    let payload = match desc.type_() {
        RtcSdpType::Offer => SignalPayload::Offer { sdp },
        RtcSdpType::Answer => SignalPayload::Answer { sdp },
        _ => return,
    };
    shared.lock().unwrap().events.push_back(ChannelEvent::Signal(payload));
}

async fn set_remote_description(
    peer: &RtcPeerConnection,
    sdp_type: RtcSdpType,
    sdp: &str,
) -> std::result::Result<(), String> {
    let desc = RtcSessionDescriptionInit::new(sdp_type);
    desc.set_sdp(sdp);
    JsFuture::from(peer.set_remote_description(&desc))
        .await
        .map_err(|e| format!("failed to set remote description: {e:?}"))?;
    Ok(())
}

fn replay_pending_candidates(peer: &RtcPeerConnection, shared: &Arc<Mutex<Shared>>) {
    let queued: Vec<_> = {
        let mut s = shared.lock().unwrap();
        s.remote_description_set = true;
        s.pending_candidates.drain(..).collect()
    };
    for payload in queued {
        if let SignalPayload::Candidate { candidate } = payload {
            let init = RtcIceCandidateInit::new(&candidate);
            if let Ok(ice) = RtcIceCandidate::new(&init) {
                let _ = peer.add_ice_candidate_with_opt_rtc_ice_candidate(Some(&ice));
            }
        }
    }
}

/// The initiator's half of §4.7 negotiation: create an offer and set it as
/// the local description. With trickle enabled, the offer is emitted right
/// away (candidates trickle separately through `onicecandidate`); with
/// trickle disabled, emission waits for `install_ice_gathering_handler` to
/// see gathering finish.
async fn negotiate_offer(
    peer: &RtcPeerConnection,
    shared: &Arc<Mutex<Shared>>,
    trickle_ice: bool,
) -> std::result::Result<(), String> {
    let offer = JsFuture::from(peer.create_offer())
        .await
        .map_err(|e| format!("failed to create offer: {e:?}"))?;
    let offer_desc = offer.unchecked_into::<RtcSessionDescriptionInit>();
    JsFuture::from(peer.set_local_description(&offer_desc))
        .await
        .map_err(|e| format!("failed to set local description: {e:?}"))?;
    if trickle_ice {
        emit_local_description(peer, shared);
    }
    Ok(())
}

/// The non-initiator's half: apply the remote offer, replay any candidates
/// queued ahead of it, then create and set the answer as the local
/// description.
async fn negotiate_answer(
    peer: &RtcPeerConnection,
    shared: &Arc<Mutex<Shared>>,
    remote_sdp: &str,
    trickle_ice: bool,
) -> std::result::Result<(), String> {
    set_remote_description(peer, RtcSdpType::Offer, remote_sdp).await?;
    replay_pending_candidates(peer, shared);

    let answer = JsFuture::from(peer.create_answer())
        .await
        .map_err(|e| format!("failed to create answer: {e:?}"))?;
    let answer_desc = answer.unchecked_into::<RtcSessionDescriptionInit>();
    JsFuture::from(peer.set_local_description(&answer_desc))
        .await
        .map_err(|e| format!("failed to set local description: {e:?}"))?;
    if trickle_ice {
        emit_local_description(peer, shared);
    }
    Ok(())
}
