//! Wormhole head and tail event state machines.
//!
//! A packet's life is two cooperating activities. The **head** walks the
//! mesh: route, arbitrate for the output-channel mux, wait for threshold
//! space in the link buffer, advance, repeat; at the destination it claims
//! an output-port slot. The **tail** follows the recorded path one hop
//! behind or more, paced so it never arrives earlier than
//! `(flits − 1) × flit_delay` after the head; as it leaves each buffer it
//! returns the packet's flit slots and signals the mux semaphore the head
//! acquired, in acquisition order — that is what wakes blocked heads
//! upstream.
//!
//! Wait-for-tail mode adds one rule: the head may not leave a buffer until
//! the tail has caught up with it, which turns the pipeline of buffers into
//! store-and-forward.

use tracing::trace;

use crate::common::{SimError, SimTime};
use crate::net::packet::{HeadState, Hop, NetMsg, TailState};
use crate::net::PacketId;

use super::events::EventBody;
use super::simulator::Simulator;

impl Simulator {
    /// Wraps a message in a packet and queues it at `from`'s input port.
    pub(super) fn inject_packet(
        &mut self,
        from: usize,
        to: usize,
        msg: NetMsg,
        extra_delay: f64,
    ) -> Result<(), SimError> {
        let now = self.driver.now();
        let vnet = vnet_of(msg);
        let flits = self.msg_flits(msg);
        let pkt = self.pkts.get();
        {
            let p = self.pkts.get_mut(pkt);
            p.msg = msg;
            p.src = from;
            p.dest = to;
            p.flits = flits;
            p.head_node = from;
            p.create_time = now + extra_delay;
        }
        let head = self
            .driver
            .alloc(EventBody::NetHead { vnet, pkt });
        let tail = self
            .driver
            .alloc(EventBody::NetTail { vnet, pkt });
        {
            let p = self.pkts.get_mut(pkt);
            p.head_act = Some(head);
            p.tail_act = Some(tail);
        }
        let mesh = &mut self.meshes[vnet as usize];
        let at_front = mesh.iport_push(from, pkt);
        if at_front {
            // Head leaves the input port after the packet-move delay.
            let t = mesh.timing.t(mesh.timing.packet);
            self.driver.wake(head, extra_delay + t)?;
        }
        trace!(target: "net", vnet, from, to, flits, "inject");
        Ok(())
    }

    /// Head event body.
    pub(super) fn net_head(&mut self, vnet: u8, pkt: PacketId) -> Result<(), SimError> {
        let now = self.driver.now();
        let v = vnet as usize;

        loop {
            let (state, node, dest, flits, hops_done) = {
                let p = self.pkts.get_ref(pkt);
                (p.head_state, p.head_node, p.dest, p.flits, p.path.len())
            };

            match state {
                HeadState::Start => {
                    // Leaving the input port: the tail departs once the
                    // interior flits have streamed out behind the head.
                    let flit_t = self.meshes[v].timing.t(self.meshes[v].timing.flit);
                    let tail = self.pkts.get_ref(pkt).tail_act;
                    if let Some(t) = tail {
                        self.driver
                            .wake(t, (flits.saturating_sub(1)) as f64 * flit_t)?;
                    }
                    let p = self.pkts.get_mut(pkt);
                    p.inject_time = now;
                    p.head_state = HeadState::NextModule;
                }
                HeadState::NextModule | HeadState::WaitMux | HeadState::WaitBuffer
                | HeadState::WaitOport | HeadState::WaitTail => {
                    // Wait-for-tail: the head may not leave its current
                    // buffer until the tail is in it too.
                    if self.meshes[v].wft && hops_done > 0 {
                        let p = self.pkts.get_ref(pkt);
                        if p.tail_hop < p.head_hop {
                            self.pkts.get_mut(pkt).head_state = HeadState::WaitTail;
                            let act = self.head_act(pkt)?;
                            self.driver.suspend(act);
                            self.pkts.get_mut(pkt).block(now);
                            return Ok(());
                        }
                    }

                    let Some(d) = self.meshes[v].route(node, dest) else {
                        // At the destination switch: claim a delivery slot.
                        if !self.meshes[v].oport_claim(dest, pkt, now) {
                            self.pkts.get_mut(pkt).head_state = HeadState::WaitOport;
                            let act = self.head_act(pkt)?;
                            self.driver.suspend(act);
                            self.pkts.get_mut(pkt).block(now);
                            return Ok(());
                        }
                        let t = self.meshes[v].timing.t(self.meshes[v].timing.packet);
                        {
                            let p = self.pkts.get_mut(pkt);
                            p.unblock(now);
                            p.head_state = HeadState::Done;
                        }
                        // The head event ends here; its slot is released
                        // and the tail finishes the packet.
                        let act = self.head_act(pkt)?;
                        self.driver.suspend(act);
                        self.driver.free(act)?;
                        self.pkts.get_mut(pkt).head_act = None;
                        // Nudge the tail in case it was sleeping behind us.
                        self.wake_sleeping_tail(pkt, t)?;
                        return Ok(());
                    };

                    let chan = self.meshes[v].chan(node, d);
                    if !self.meshes[v].mux_acquire(chan, pkt) {
                        self.pkts.get_mut(pkt).head_state = HeadState::WaitMux;
                        let act = self.head_act(pkt)?;
                        self.driver.suspend(act);
                        self.pkts.get_mut(pkt).block(now);
                        return Ok(());
                    }
                    let Some(held) = self.meshes[v].buf_reserve(chan, pkt, flits, now) else {
                        self.pkts.get_mut(pkt).head_state = HeadState::WaitBuffer;
                        let act = self.head_act(pkt)?;
                        self.driver.suspend(act);
                        self.pkts.get_mut(pkt).block(now);
                        return Ok(());
                    };

                    // Advance one hop.
                    let to_node = self.meshes[v]
                        .neighbor(node, d)
                        .unwrap_or(node);
                    let hop_t = self.meshes[v].timing.head_hop();
                    {
                        let p = self.pkts.get_mut(pkt);
                        p.unblock(now);
                        p.path.push(Hop {
                            mux: chan,
                            buf: chan,
                            to_node,
                            flits_held: held,
                            head_done: now + hop_t,
                        });
                        p.head_node = to_node;
                        p.head_hop += 1;
                        p.head_state = HeadState::NextModule;
                    }
                    let act = self.head_act(pkt)?;
                    self.driver.suspend(act);
                    self.driver.wake(act, hop_t)?;
                    // A tail sleeping behind us may now advance.
                    self.wake_sleeping_tail(pkt, hop_t)?;
                    return Ok(());
                }
                HeadState::Done => return Ok(()),
            }
        }
    }

    /// Tail event body.
    pub(super) fn net_tail(&mut self, vnet: u8, pkt: PacketId) -> Result<(), SimError> {
        let now = self.driver.now();
        let v = vnet as usize;

        let (state, tail_hop, path_len, flits) = {
            let p = self.pkts.get_ref(pkt);
            (p.tail_state, p.tail_hop, p.path.len(), p.flits)
        };
        let flit_t = self.meshes[v].timing.t(self.meshes[v].timing.flit);
        let lag = (flits.saturating_sub(1)) as f64 * flit_t;

        match state {
            TailState::Done => Ok(()),
            TailState::Start => {
                // The tail leaves the input port: the next queued packet's
                // head may start.
                let src = self.pkts.get_ref(pkt).src;
                if let Some(next) = self.meshes[v].iport_advance(src) {
                    let t = self.meshes[v].timing.t(self.meshes[v].timing.packet);
                    if let Some(h) = self.pkts.get_ref(next).head_act {
                        self.driver.wake(h, t)?;
                    }
                }
                self.pkts.get_mut(pkt).tail_state = TailState::Move;
                self.advance_tail(v, pkt, now, lag)
            }
            TailState::Move | TailState::SleepBehindHead => {
                let _ = (tail_hop, path_len);
                self.advance_tail(v, pkt, now, lag)
            }
        }
    }

    /// Moves the tail through as many hops as the head allows, releasing
    /// resources, then either sleeps behind the head or finishes.
    fn advance_tail(
        &mut self,
        v: usize,
        pkt: PacketId,
        now: SimTime,
        lag: f64,
    ) -> Result<(), SimError> {
        let (k, head_done, head_hop, path_len) = {
            let p = self.pkts.get_ref(pkt);
            (
                p.tail_hop,
                p.head_state == HeadState::Done,
                p.head_hop,
                p.path.len(),
            )
        };

        if k < path_len {
            // Next hop exists. The tail may enter path[k] only once the
            // head has cleared it.
            if head_hop <= k && !head_done {
                self.pkts.get_mut(pkt).tail_state = TailState::SleepBehindHead;
                let act = self.tail_act(pkt)?;
                self.driver.suspend(act);
                return Ok(());
            }
            let hop = self.pkts.get_ref(pkt).path[k];

            // Passing the mux the head acquired for this hop releases it.
            if let Some(waiter) = self.meshes[v].mux_release(hop.mux, pkt) {
                self.wake_head_of(waiter, self.meshes[v].timing.t(self.meshes[v].timing.arb))?;
            }
            // Leaving the previous buffer returns its flit slots.
            if k > 0 {
                let prev = self.pkts.get_ref(pkt).path[k - 1];
                if let Some(waiter) =
                    self.meshes[v].buf_release(prev.buf, prev.flits_held, now)
                {
                    self.wake_head_of(waiter, 0.0)?;
                }
            }
            {
                let p = self.pkts.get_mut(pkt);
                p.tail_hop = k + 1;
            }
            // WFT: the head may have been waiting for us in this buffer.
            self.wake_wft_head(pkt)?;

            // Interior flits stream one per flit time behind the head: the
            // tail finishes this hop no earlier than head_done + lag.
            let earliest = hop.head_done + lag;
            let cost = self.meshes[v].timing.tail_hop();
            let next_at = (now + cost).max(earliest);
            let act = self.tail_act(pkt)?;
            self.driver.suspend(act);
            self.driver.wake(act, next_at - now)?;
            return Ok(());
        }

        // All hops done: the packet completes when the head has its
        // output-port slot.
        if !head_done {
            self.pkts.get_mut(pkt).tail_state = TailState::SleepBehindHead;
            let act = self.tail_act(pkt)?;
            self.driver.suspend(act);
            return Ok(());
        }
        // Release the last buffer on the path.
        if path_len > 0 {
            let last = self.pkts.get_ref(pkt).path[path_len - 1];
            if let Some(waiter) = self.meshes[v].buf_release(last.buf, last.flits_held, now) {
                self.wake_head_of(waiter, 0.0)?;
            }
        }
        self.finish_packet(v, pkt, now)
    }

    fn finish_packet(&mut self, v: usize, pkt: PacketId, now: SimTime) -> Result<(), SimError> {
        let (dest, msg, create, blocked, flits, hops) = {
            let p = self.pkts.get_mut(pkt);
            p.tail_state = TailState::Done;
            p.unblock(now);
            (
                p.dest,
                p.msg,
                p.create_time,
                p.blocked_time,
                p.flits,
                p.hops(),
            )
        };
        let m = &mut self.meshes[v];
        m.stats.delivered += 1;
        m.stats.size.update(flits as f64, 1.0);
        m.stats.hops.update(hops as f64, 1.0);
        m.stats.lifetime.update(now - create, 1.0);
        m.stats.blocked.update(blocked, 1.0);

        // The node consumes the packet immediately; the port slot frees.
        if let Some(waiter) = self.meshes[v].oport_release(dest, now) {
            self.wake_head_of(waiter, 0.0)?;
        }

        let tail = self.tail_act(pkt)?;
        self.driver.suspend(tail);
        self.driver.free(tail)?;
        {
            let p = self.pkts.get_mut(pkt);
            p.tail_act = None;
        }
        self.pkts.put(pkt, now)?;
        trace!(target: "net", vnet = v, dest, ?msg, "delivered");

        let body = Self::deliver_body(dest, msg);
        self.sched(body, 0.0)
    }

    // ---- small helpers -------------------------------------------------

    fn head_act(&self, pkt: PacketId) -> Result<crate::event::ActId, SimError> {
        self.pkts
            .get_ref(pkt)
            .head_act
            .ok_or_else(|| SimError::EventListCorrupt {
                detail: "packet lost its head event".into(),
                now: self.driver.now(),
            })
    }

    fn tail_act(&self, pkt: PacketId) -> Result<crate::event::ActId, SimError> {
        self.pkts
            .get_ref(pkt)
            .tail_act
            .ok_or_else(|| SimError::EventListCorrupt {
                detail: "packet lost its tail event".into(),
                now: self.driver.now(),
            })
    }

    /// Wakes the head of `pkt` (if it still has one) after `delay`.
    fn wake_head_of(&mut self, pkt: PacketId, delay: f64) -> Result<(), SimError> {
        if let Some(act) = self.pkts.get_ref(pkt).head_act {
            let state = self.pkts.get_ref(pkt).head_state;
            if state != HeadState::Done {
                self.pkts.get_mut(pkt).head_state = HeadState::NextModule;
                self.driver.wake(act, delay)?;
            }
        }
        Ok(())
    }

    /// Wakes this packet's own head if it is in a wait-for-tail stall and
    /// the tail has caught up.
    fn wake_wft_head(&mut self, pkt: PacketId) -> Result<(), SimError> {
        let (state, head_hop, tail_hop, act) = {
            let p = self.pkts.get_ref(pkt);
            (p.head_state, p.head_hop, p.tail_hop, p.head_act)
        };
        if state == HeadState::WaitTail && tail_hop >= head_hop {
            if let Some(a) = act {
                self.pkts.get_mut(pkt).head_state = HeadState::NextModule;
                self.driver.wake(a, 0.0)?;
            }
        }
        Ok(())
    }

    /// Wakes a tail sleeping behind its head.
    fn wake_sleeping_tail(&mut self, pkt: PacketId, delay: f64) -> Result<(), SimError> {
        let (state, act) = {
            let p = self.pkts.get_ref(pkt);
            (p.tail_state, p.tail_act)
        };
        if state == TailState::SleepBehindHead {
            if let Some(a) = act {
                self.pkts.get_mut(pkt).tail_state = TailState::Move;
                self.driver.wake(a, delay)?;
            }
        }
        Ok(())
    }

    /// Flit count of a message (head + payload + tail framing).
    pub(super) fn msg_flits(&self, msg: NetMsg) -> usize {
        if msg.carries_data() {
            2 + (self.line_bytes() / 8) as usize
        } else {
            2
        }
    }
}

/// The virtual network a message class travels on: requests and
/// invalidations on one, replies and acks on the other, so a reply can
/// never be blocked behind the request that needs it.
fn vnet_of(msg: NetMsg) -> u8 {
    match msg {
        NetMsg::Request { .. }
        | NetMsg::Writeback { .. }
        | NetMsg::Transfer { .. }
        | NetMsg::Inval { .. } => crate::net::VNET_REQUEST,
        _ => crate::net::VNET_REPLY,
    }
}
