//! In-process simulated servo bus.
//!
//! [`VirtualServoBus::connect`] hands out one end of an in-memory duplex
//! stream and serves the other end like a daisy chain of servos would:
//! register reads and writes, pings, broadcast sync-writes. Goal positions
//! are reached instantly while torque is on. With torque off the present
//! position only changes through [`VirtualServoBus::set_present_degrees`],
//! which stands in for a hand-moved leader arm.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use super::family::{ServoFamily, REG_GOAL_POSITION, REG_GOAL_SPEED, REG_PRESENT_POSITION, REG_TORQUE_ENABLE};
use super::frame::{encode_status, FrameDecoder, Instruction, Packet, BROADCAST_ID};
use crate::joint::ServoId;

const REGISTER_COUNT: usize = 256;
const DUPLEX_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct SimServo {
    registers: [u8; REGISTER_COUNT],
    silent: bool,
    status: u8,
}

impl SimServo {
    fn new(family: ServoFamily) -> Self {
        let mut registers = [0u8; REGISTER_COUNT];
        let center = family.encode_u16(family.degrees_to_steps(180.0));
        let goal = REG_GOAL_POSITION as usize;
        let present = REG_PRESENT_POSITION as usize;
        registers[goal..goal + 2].copy_from_slice(&center);
        registers[present..present + 2].copy_from_slice(&center);
        Self {
            registers,
            silent: false,
            status: 0,
        }
    }

    fn write(&mut self, address: u8, data: &[u8]) {
        let start = address as usize;
        let end = (start + data.len()).min(REGISTER_COUNT);
        self.registers[start..end].copy_from_slice(&data[..end - start]);

        let goal = REG_GOAL_POSITION as usize;
        let touches_goal = start <= goal && end >= goal + 2;
        if touches_goal && self.registers[REG_TORQUE_ENABLE as usize] != 0 {
            let present = REG_PRESENT_POSITION as usize;
            self.registers.copy_within(goal..goal + 2, present);
        }
    }

    fn read(&self, address: u8, length: u8) -> Vec<u8> {
        let start = address as usize;
        let end = (start + length as usize).min(REGISTER_COUNT);
        self.registers[start..end].to_vec()
    }

    fn word(&self, family: ServoFamily, address: u8) -> u16 {
        let a = address as usize;
        family.decode_u16([self.registers[a], self.registers[a + 1]])
    }
}

#[derive(Debug)]
struct SimState {
    family: ServoFamily,
    servos: BTreeMap<ServoId, SimServo>,
    corrupt_next: bool,
    requests: usize,
    sync_writes: usize,
    sync_reads: usize,
    cancel: CancellationToken,
}

/// Cloneable handle to a simulated bus; clones share the same servos.
#[derive(Clone, Debug)]
pub struct VirtualServoBus {
    state: Arc<Mutex<SimState>>,
}

impl VirtualServoBus {
    pub fn new(family: ServoFamily, ids: impl IntoIterator<Item = ServoId>) -> Self {
        let servos = ids.into_iter().map(|id| (id, SimServo::new(family))).collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                family,
                servos,
                corrupt_next: false,
                requests: 0,
                sync_writes: 0,
                sync_reads: 0,
                cancel: CancellationToken::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new connection to the bus. Must be called inside a tokio runtime.
    pub fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let cancel = self.lock().cancel.clone();
        let bus = self.clone();
        tokio::spawn(async move { bus.serve(server, cancel).await });
        client
    }

    /// Drop every open connection, as if the adapter was unplugged.
    pub fn sever(&self) {
        let mut state = self.lock();
        state.cancel.cancel();
        state.cancel = CancellationToken::new();
    }

    pub fn set_present_degrees(&self, id: ServoId, degrees: f64) {
        let mut state = self.lock();
        let family = state.family;
        if let Some(servo) = state.servos.get_mut(&id) {
            let a = REG_PRESENT_POSITION as usize;
            let bytes = family.encode_u16(family.degrees_to_steps(degrees));
            servo.registers[a..a + 2].copy_from_slice(&bytes);
        }
    }

    pub fn goal_degrees(&self, id: ServoId) -> Option<f64> {
        let state = self.lock();
        let family = state.family;
        state
            .servos
            .get(&id)
            .map(|s| family.steps_to_degrees(s.word(family, REG_GOAL_POSITION)))
    }

    pub fn goal_speed(&self, id: ServoId) -> Option<f64> {
        let state = self.lock();
        let family = state.family;
        state
            .servos
            .get(&id)
            .map(|s| family.decode_speed(s.word(family, REG_GOAL_SPEED)))
    }

    pub fn torque_enabled(&self, id: ServoId) -> Option<bool> {
        self.lock()
            .servos
            .get(&id)
            .map(|s| s.registers[REG_TORQUE_ENABLE as usize] != 0)
    }

    /// Make a servo stop answering (it still applies writes).
    pub fn set_silent(&self, id: ServoId, silent: bool) {
        if let Some(servo) = self.lock().servos.get_mut(&id) {
            servo.silent = silent;
        }
    }

    /// Status byte a servo reports in its responses.
    pub fn set_status(&self, id: ServoId, status: u8) {
        if let Some(servo) = self.lock().servos.get_mut(&id) {
            servo.status = status;
        }
    }

    /// Flip a bit in the checksum of the next response.
    pub fn corrupt_next_response(&self) {
        self.lock().corrupt_next = true;
    }

    pub fn requests(&self) -> usize {
        self.lock().requests
    }

    pub fn sync_writes(&self) -> usize {
        self.lock().sync_writes
    }

    pub fn sync_reads(&self) -> usize {
        self.lock().sync_reads
    }

    async fn serve(self, mut io: DuplexStream, cancel: CancellationToken) {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                read = io.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };
            decoder.extend(&buf[..n]);

            loop {
                match decoder.next_frame() {
                    Ok(Some(packet)) => {
                        let Some(reply) = self.handle(&packet) else {
                            continue;
                        };
                        if io.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    // A real servo ignores frames it cannot verify.
                    Err(_) => continue,
                }
            }
        }
        tracing::trace!("Virtual servo bus connection closed");
    }

    fn handle(&self, packet: &Packet) -> Option<Vec<u8>> {
        let instruction = Instruction::from_packet(packet).ok()?;
        let mut state = self.lock();
        state.requests += 1;

        if packet.id == BROADCAST_ID {
            match instruction {
                Instruction::SyncWrite { address, writes, .. } => {
                    state.sync_writes += 1;
                    for (id, data) in writes {
                        if let Some(servo) = state.servos.get_mut(&id) {
                            servo.write(address, &data);
                        }
                    }
                }
                Instruction::Write { address, data } => {
                    for servo in state.servos.values_mut() {
                        servo.write(address, &data);
                    }
                }
                Instruction::SyncRead {
                    address,
                    length,
                    ids,
                } => {
                    state.sync_reads += 1;
                    // Servos answer in request order; silent ones leave a gap.
                    let mut replies = Vec::new();
                    for id in ids {
                        let Some(servo) = state.servos.get(&id).filter(|s| !s.silent) else {
                            continue;
                        };
                        if let Ok(frame) = encode_status(id, servo.status, &servo.read(address, length)) {
                            replies.extend_from_slice(&frame);
                        }
                    }
                    return (!replies.is_empty()).then_some(replies);
                }
                _ => {}
            }
            return None;
        }

        let servo = state.servos.get_mut(&packet.id)?;
        let params = match instruction {
            Instruction::Ping => Vec::new(),
            Instruction::Read { address, length } => servo.read(address, length),
            Instruction::Write { address, data } => {
                servo.write(address, &data);
                Vec::new()
            }
            Instruction::SyncRead { .. } | Instruction::SyncWrite { .. } => return None,
        };
        if servo.silent {
            return None;
        }

        let status = servo.status;
        let mut reply = encode_status(packet.id, status, &params).ok()?.to_vec();
        if state.corrupt_next {
            state.corrupt_next = false;
            if let Some(last) = reply.last_mut() {
                *last ^= 0x01;
            }
        }
        Some(reply)
    }
}
