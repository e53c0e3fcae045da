//! Request/response driver for one half-duplex servo bus.

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::family::{
    ServoFamily, SyncEntry, MOTION_BLOCK_LEN, REG_ACC, REG_GOAL_SPEED, REG_PRESENT_POSITION,
    REG_TORQUE_ENABLE,
};
use super::frame::{encode_instruction, FrameDecoder, Instruction, Packet, BROADCAST_ID};
use crate::error::BusError;
use crate::joint::ServoId;

/// Quiet period used to drain stale bytes after a failed request.
const DRAIN_QUIET: Duration = Duration::from_millis(1);

/// Result of a batched write. Entries that succeeded keep their new target
/// even when others failed.
#[derive(Debug, Default)]
pub struct SyncWriteOutcome {
    pub written: Vec<ServoId>,
    pub failed: Vec<(ServoId, BusError)>,
}

impl SyncWriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.written.is_empty() && !self.failed.is_empty()
    }

    /// Whether any failure means the transport is gone.
    pub fn transport_failed(&self) -> bool {
        self.failed.iter().any(|(_, e)| e.is_transport_failure())
    }
}

/// Servo-bus client over any async byte stream.
///
/// One request is outstanding at a time; `&mut self` on every operation
/// enforces it. Requests are never retried here: a failed request is
/// reported and the caller decides whether to try again on a later tick.
#[derive(Debug)]
pub struct ServoBusClient<T> {
    io: T,
    family: ServoFamily,
    timeout: Duration,
    decoder: FrameDecoder,
    resync: bool,
}

impl<T> ServoBusClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: T, family: ServoFamily, timeout: Duration) -> Self {
        Self {
            io,
            family,
            timeout,
            decoder: FrameDecoder::new(),
            resync: false,
        }
    }

    pub fn family(&self) -> ServoFamily {
        self.family
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    pub async fn ping(&mut self, id: ServoId) -> Result<(), BusError> {
        self.transact(id, &Instruction::Ping).await.map(|_| ())
    }

    /// Move a servo to `degrees`. `speed_hint` is the raw goal speed, 0 for
    /// the servo's default.
    pub async fn write_position(
        &mut self,
        id: ServoId,
        degrees: f64,
        speed_hint: u16,
    ) -> Result<(), BusError> {
        let data = self
            .family
            .motion_block(self.family.degrees_to_steps(degrees), speed_hint);
        self.write(id, REG_ACC, data).await
    }

    /// Set a wheel-mode servo's signed speed.
    pub async fn write_speed(&mut self, id: ServoId, speed: f64) -> Result<(), BusError> {
        let data = self.family.encode_u16(self.family.encode_speed(speed)).to_vec();
        self.write(id, REG_GOAL_SPEED, data).await
    }

    pub async fn write_torque_enable(&mut self, id: ServoId, enable: bool) -> Result<(), BusError> {
        self.write(id, REG_TORQUE_ENABLE, vec![u8::from(enable)]).await
    }

    pub async fn read_position(&mut self, id: ServoId) -> Result<f64, BusError> {
        if id == BROADCAST_ID {
            return Err(BusError::InvalidRequest("cannot read from broadcast id"));
        }
        let status = self
            .transact(
                id,
                &Instruction::Read {
                    address: REG_PRESENT_POSITION,
                    length: 2,
                },
            )
            .await?;
        let &[lo, hi] = status.params.as_slice() else {
            self.resync = true;
            return Err(BusError::Corrupt);
        };
        Ok(self.family.steps_to_degrees(self.family.decode_u16([lo, hi])))
    }

    /// Read the present position of several servos.
    ///
    /// Families with sync-write also answer a broadcast sync-read with one
    /// status per servo; the others are read one request at a time. A servo
    /// that does not answer only fails its own entry.
    pub async fn read_positions(&mut self, ids: &[ServoId]) -> Vec<(ServoId, Result<f64, BusError>)> {
        if ids.contains(&BROADCAST_ID) {
            return ids
                .iter()
                .map(|&id| (id, Err(BusError::InvalidRequest("cannot read from broadcast id"))))
                .collect();
        }
        if !self.family.supports_sync_write() || ids.len() < 2 {
            let mut results = Vec::with_capacity(ids.len());
            for (i, &id) in ids.iter().enumerate() {
                match self.read_position(id).await {
                    Err(e) if e.is_transport_failure() => {
                        let rest: Vec<_> = ids[i + 1..].iter().map(|&r| (r, Err(e.duplicate()))).collect();
                        results.push((id, Err(e)));
                        results.extend(rest);
                        break;
                    }
                    result => results.push((id, result)),
                }
            }
            return results;
        }

        let instruction = Instruction::SyncRead {
            address: REG_PRESENT_POSITION,
            length: 2,
            ids: ids.to_vec(),
        };
        let collected = match self.send(BROADCAST_ID, &instruction).await {
            Ok(()) => self.collect_statuses(ids).await,
            Err(e) => Err(e),
        };
        let mut statuses = match collected {
            Ok(statuses) => statuses,
            Err(e) => return ids.iter().map(|&id| (id, Err(e.duplicate()))).collect(),
        };

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let result = match statuses.remove(&id) {
                None => Err(BusError::Timeout),
                Some(packet) if packet.code != 0 => Err(BusError::Nack {
                    id,
                    status: packet.code,
                }),
                Some(packet) => match packet.params.as_slice() {
                    &[lo, hi] => Ok(self.family.steps_to_degrees(self.family.decode_u16([lo, hi]))),
                    _ => {
                        self.resync = true;
                        Err(BusError::Corrupt)
                    }
                },
            };
            results.push((id, result));
        }
        results
    }

    /// Update several servos in one bus transaction.
    ///
    /// Families without sync-write fall back to one acknowledged write per
    /// servo, which can succeed partially.
    pub async fn sync_write(&mut self, entries: &[SyncEntry]) -> SyncWriteOutcome {
        let mut outcome = SyncWriteOutcome::default();
        if entries.is_empty() {
            return outcome;
        }

        if self.family.supports_sync_write() {
            let instruction = Instruction::SyncWrite {
                address: REG_ACC,
                length: MOTION_BLOCK_LEN,
                writes: entries
                    .iter()
                    .map(|e| (e.servo_id(), e.motion_block(self.family)))
                    .collect(),
            };
            match self.send(BROADCAST_ID, &instruction).await {
                Ok(()) => outcome.written = entries.iter().map(|e| e.servo_id()).collect(),
                Err(e) => {
                    outcome.failed = entries.iter().map(|x| (x.servo_id(), e.duplicate())).collect();
                }
            }
            return outcome;
        }

        for (i, entry) in entries.iter().enumerate() {
            let result = match *entry {
                SyncEntry::Position {
                    servo_id,
                    degrees,
                    speed_hint,
                } => self.write_position(servo_id, degrees, speed_hint).await,
                SyncEntry::Speed { servo_id, speed } => self.write_speed(servo_id, speed).await,
            };
            match result {
                Ok(()) => outcome.written.push(entry.servo_id()),
                Err(e) if e.is_transport_failure() => {
                    let rest: Vec<_> = entries[i + 1..]
                        .iter()
                        .map(|r| (r.servo_id(), e.duplicate()))
                        .collect();
                    outcome.failed.push((entry.servo_id(), e));
                    outcome.failed.extend(rest);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Servo {} write failed: {}", entry.servo_id(), e);
                    outcome.failed.push((entry.servo_id(), e));
                }
            }
        }
        outcome
    }

    pub async fn shutdown(&mut self) -> Result<(), BusError> {
        self.io.shutdown().await?;
        Ok(())
    }

    async fn write(&mut self, id: ServoId, address: u8, data: Vec<u8>) -> Result<(), BusError> {
        let instruction = Instruction::Write { address, data };
        if id == BROADCAST_ID {
            // Broadcast writes are never acknowledged.
            return self.send(id, &instruction).await;
        }
        self.transact(id, &instruction).await.map(|_| ())
    }

    async fn send(&mut self, id: ServoId, instruction: &Instruction) -> Result<(), BusError> {
        let frame = encode_instruction(id, instruction)?;
        if self.resync {
            self.drain().await?;
        }
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn transact(&mut self, id: ServoId, instruction: &Instruction) -> Result<Packet, BusError> {
        self.send(id, instruction).await?;
        self.read_status(id).await
    }

    async fn read_status(&mut self, id: ServoId) -> Result<Packet, BusError> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 64];

        loop {
            match self.decoder.next_frame() {
                Ok(Some(packet)) if packet.id != id => {
                    tracing::trace!("Discarding status from servo {} while waiting for {}", packet.id, id);
                    continue;
                }
                Ok(Some(packet)) => {
                    if packet.code != 0 {
                        return Err(BusError::Nack {
                            id,
                            status: packet.code,
                        });
                    }
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    self.resync = true;
                    return Err(e);
                }
            }

            match tokio::time::timeout_at(deadline, self.io.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(BusError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "servo bus closed",
                    )))
                }
                Ok(Ok(n)) => self.decoder.extend(&buf[..n]),
                Ok(Err(e)) => return Err(BusError::Io(e)),
                Err(_) => {
                    tracing::debug!("Servo {} did not answer within {:?}", id, self.timeout);
                    self.resync = true;
                    return Err(BusError::Timeout);
                }
            }
        }
    }

    /// Gather one status per id until all answered or the deadline passes.
    /// Missing ids are left out of the map.
    async fn collect_statuses(&mut self, ids: &[ServoId]) -> Result<BTreeMap<ServoId, Packet>, BusError> {
        let deadline = Instant::now() + self.timeout;
        let mut statuses = BTreeMap::new();
        let mut buf = [0u8; 64];

        while statuses.len() < ids.len() {
            match self.decoder.next_frame() {
                Ok(Some(packet)) if ids.contains(&packet.id) => {
                    statuses.insert(packet.id, packet);
                    continue;
                }
                Ok(Some(packet)) => {
                    tracing::trace!("Discarding status from servo {} during sync-read", packet.id);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("Sync-read stopped on a bad frame: {}", e);
                    self.resync = true;
                    break;
                }
            }

            match tokio::time::timeout_at(deadline, self.io.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(BusError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "servo bus closed",
                    )))
                }
                Ok(Ok(n)) => self.decoder.extend(&buf[..n]),
                Ok(Err(e)) => return Err(BusError::Io(e)),
                Err(_) => {
                    tracing::debug!(
                        "Sync-read: {} of {} servos answered within {:?}",
                        statuses.len(),
                        ids.len(),
                        self.timeout
                    );
                    self.resync = true;
                    break;
                }
            }
        }
        Ok(statuses)
    }

    /// Throw away anything a late responder is still sending.
    async fn drain(&mut self) -> Result<(), BusError> {
        let mut buf = [0u8; 64];
        loop {
            match tokio::time::timeout(DRAIN_QUIET, self.io.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    return Err(BusError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "servo bus closed",
                    )))
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(BusError::Io(e)),
                Err(_) => break,
            }
        }
        self.decoder.clear();
        self.resync = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::VirtualServoBus;
    use tokio::io::DuplexStream;

    const TIMEOUT: Duration = Duration::from_millis(30);

    fn setup(family: ServoFamily) -> (VirtualServoBus, ServoBusClient<DuplexStream>) {
        let bus = VirtualServoBus::new(family, [1, 2, 3]);
        let client = ServoBusClient::new(bus.connect(), family, TIMEOUT);
        (bus, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_and_read_position() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        client.ping(1).await.unwrap();
        client.write_torque_enable(1, true).await.unwrap();
        client.write_position(1, 90.0, 0).await.unwrap();

        assert_eq!(bus.goal_degrees(1), Some(90.0));
        assert_eq!(client.read_position(1).await.unwrap(), 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_torque_off_keeps_present_position() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        client.write_torque_enable(2, false).await.unwrap();
        client.write_position(2, 90.0, 0).await.unwrap();
        assert_eq!(client.read_position(2).await.unwrap(), 180.0);

        bus.set_present_degrees(2, 45.0);
        assert_eq!(client.read_position(2).await.unwrap(), 45.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_recover() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        bus.set_silent(2, true);

        assert!(matches!(client.read_position(2).await, Err(BusError::Timeout)));
        assert!(matches!(client.ping(9).await, Err(BusError::Timeout)));
        client.ping(1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_response_is_rejected() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        bus.corrupt_next_response();

        assert!(matches!(client.read_position(1).await, Err(BusError::Corrupt)));
        assert_eq!(client.read_position(1).await.unwrap(), 180.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_carries_status() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        bus.set_status(3, 0x20);

        let err = client.write_position(3, 10.0, 0).await.unwrap_err();
        assert!(matches!(err, BusError::Nack { id: 3, status: 0x20 }));
        assert!(!err.is_transport_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_write_is_one_broadcast() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        for id in 1..=3 {
            client.write_torque_enable(id, true).await.unwrap();
        }

        let entries = [
            SyncEntry::Position {
                servo_id: 1,
                degrees: 90.0,
                speed_hint: 0,
            },
            SyncEntry::Position {
                servo_id: 2,
                degrees: 270.0,
                speed_hint: 0,
            },
            SyncEntry::Speed {
                servo_id: 3,
                speed: -40.0,
            },
        ];
        let outcome = client.sync_write(&entries).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.written, vec![1, 2, 3]);

        // The next acknowledged request is served after the broadcast.
        client.ping(1).await.unwrap();
        assert_eq!(bus.sync_writes(), 1);
        assert_eq!(bus.goal_degrees(1), Some(90.0));
        assert_eq!(bus.goal_degrees(2), Some(270.0));
        assert_eq!(bus.goal_speed(3), Some(-40.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_writes_report_partial_failure() {
        let (bus, mut client) = setup(ServoFamily::Scs);
        bus.set_silent(2, true);

        let entries: Vec<_> = (1..=3)
            .map(|id| SyncEntry::Position {
                servo_id: id,
                degrees: 150.0,
                speed_hint: 0,
            })
            .collect();
        let outcome = client.sync_write(&entries).await;

        assert!(outcome.is_partial());
        assert_eq!(outcome.written, vec![1, 3]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(outcome.failed[0], (2, BusError::Timeout)));
        assert!(!outcome.transport_failed());
        assert_eq!(bus.sync_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_severed_bus_is_a_transport_failure() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        bus.sever();

        let err = client.read_position(1).await.unwrap_err();
        assert!(err.is_transport_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_read_reports_each_servo() {
        let (bus, mut client) = setup(ServoFamily::Sts);
        bus.set_present_degrees(1, 90.0);
        bus.set_present_degrees(3, 270.0);
        bus.set_silent(2, true);

        let results = client.read_positions(&[1, 2, 3]).await;
        assert_eq!(bus.sync_reads(), 1);
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], (1, Ok(d)) if d == 90.0));
        assert!(matches!(results[1], (2, Err(BusError::Timeout))));
        assert!(matches!(results[2], (3, Ok(d)) if d == 270.0));

        // The line is usable again after the missing answer.
        client.ping(1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_positions_without_sync_read() {
        let (bus, mut client) = setup(ServoFamily::Scs);
        bus.set_status(2, 0x20);

        let results = client.read_positions(&[1, 2, 3]).await;
        assert_eq!(bus.sync_reads(), 0);
        assert!(matches!(results[0], (1, Ok(_))));
        assert!(matches!(results[1], (2, Err(BusError::Nack { id: 2, status: 0x20 }))));
        assert!(matches!(results[2], (3, Ok(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_read_is_invalid() {
        let (_bus, mut client) = setup(ServoFamily::Sts);
        assert!(matches!(
            client.read_position(BROADCAST_ID).await,
            Err(BusError::InvalidRequest(_))
        ));
    }
}
