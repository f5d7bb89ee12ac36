//! Heartbeat sources: at-least-once delivery of opaque keyed payloads with
//! explicit acknowledgement.

use std::collections::{HashMap, VecDeque};
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use podmeter_core::{MeterError, MeterResult, UsageObservation, UserId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One message handed to the consumer. Must be acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    /// Partition key (workload identity) as set by the producer.
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[async_trait::async_trait]
pub trait HeartbeatSource: Send {
    /// Next delivery, or `None` once the stream is closed and drained.
    async fn recv(&mut self) -> Option<Delivery>;

    /// Mark the delivery as processed.
    async fn ack(&mut self, tag: u64) -> Result<()>;

    /// Hand the delivery back for redelivery.
    async fn nack(&mut self, tag: u64) -> Result<()>;
}

/// Wire shape of a heartbeat. Accepts the sidecar's legacy field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(alias = "pod_name")]
    pub workload_id: String,
    pub namespace: String,
    pub user_id: UserId,
    pub start_time: DateTime<Utc>,
    #[serde(alias = "last_update")]
    pub observed_at: DateTime<Utc>,
}

impl From<HeartbeatPayload> for UsageObservation {
    fn from(p: HeartbeatPayload) -> Self {
        UsageObservation {
            workload_id: p.workload_id,
            namespace: p.namespace,
            user_id: p.user_id,
            start_time: p.start_time,
            observed_at: p.observed_at,
        }
    }
}

pub fn decode_heartbeat(bytes: &[u8]) -> MeterResult<UsageObservation> {
    let p: HeartbeatPayload =
        serde_json::from_slice(bytes).map_err(|e| MeterError::MalformedObservation(e.to_string()))?;
    let obs = UsageObservation::from(p);
    obs.validate()?;
    Ok(obs)
}

/// Delivery counters shared between a queue and its observers.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
}

impl QueueCounters {
    pub fn acked(&self) -> u64 { self.acked.load(Ordering::Relaxed) }
    pub fn nacked(&self) -> u64 { self.nacked.load(Ordering::Relaxed) }
    pub fn delivered(&self) -> u64 { self.delivered.load(Ordering::Relaxed) }
}

/// Producer side of a `MemoryQueue`.
#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<(String, Vec<u8>)>,
}

impl QueueProducer {
    pub async fn send(&self, key: impl Into<String>, payload: Vec<u8>) -> Result<()> {
        self.tx.send((key.into(), payload)).await.map_err(|_| anyhow!("heartbeat queue closed"))
    }

    pub async fn send_heartbeat(&self, hb: &HeartbeatPayload) -> Result<()> {
        let key = format!("{}/{}", hb.namespace, hb.workload_id);
        self.send(key, serde_json::to_vec(hb)?).await
    }

    /// For producers running on a plain thread; must not be called from
    /// inside the async runtime.
    pub fn blocking_send(&self, key: impl Into<String>, payload: Vec<u8>) -> Result<()> {
        self.tx.blocking_send((key.into(), payload)).map_err(|_| anyhow!("heartbeat queue closed"))
    }
}

/// Feed newline-delimited heartbeats from a blocking reader (stdin) into a
/// queue on a detached thread. The thread ends on EOF, a read error, or once
/// the queue's consumer is gone; the runtime never waits on it.
pub fn pump_lines<R: BufRead + Send + 'static>(reader: R, producer: QueueProducer) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for (n, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "heartbeat reader failed; closing source");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if producer.blocking_send(format!("stdin:{}", n + 1), line.into_bytes()).is_err() {
                debug!("heartbeat queue closed; reader exiting");
                break;
            }
        }
    })
}

/// In-process queue. Nacked deliveries go to the front of the line; deliveries
/// left unacknowledged when the consumer goes away are lost with the process.
pub struct MemoryQueue {
    rx: mpsc::Receiver<(String, Vec<u8>)>,
    redeliver: VecDeque<Delivery>,
    in_flight: HashMap<u64, Delivery>,
    next_tag: u64,
    counters: Arc<QueueCounters>,
}

impl MemoryQueue {
    pub fn new(cap: usize) -> (QueueProducer, Self) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        let q = Self {
            rx,
            redeliver: VecDeque::new(),
            in_flight: HashMap::new(),
            next_tag: 1,
            counters: Arc::new(QueueCounters::default()),
        };
        (QueueProducer { tx }, q)
    }

    pub fn counters(&self) -> Arc<QueueCounters> { Arc::clone(&self.counters) }

    fn hand_out(&mut self, d: Delivery) -> Delivery {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(d.tag, d.clone());
        d
    }
}

#[async_trait::async_trait]
impl HeartbeatSource for MemoryQueue {
    async fn recv(&mut self) -> Option<Delivery> {
        if let Some(mut d) = self.redeliver.pop_front() {
            d.attempt += 1;
            return Some(self.hand_out(d));
        }
        let (key, payload) = self.rx.recv().await?;
        let tag = self.next_tag;
        self.next_tag += 1;
        Some(self.hand_out(Delivery { tag, key, payload, attempt: 1 }))
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        self.in_flight.remove(&tag).ok_or_else(|| anyhow!("ack for unknown delivery tag {}", tag))?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&mut self, tag: u64) -> Result<()> {
        let d = self.in_flight.remove(&tag).ok_or_else(|| anyhow!("nack for unknown delivery tag {}", tag))?;
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
        debug!(tag, key = %d.key, attempt = d.attempt, "delivery returned for redelivery");
        self.redeliver.push_back(d);
        Ok(())
    }
}

/// Newline-delimited JSON heartbeats from an async reader (e.g. stdin).
/// Blank lines are skipped; a nacked line is handed out again.
pub struct LineSource<R> {
    lines: Lines<R>,
    pending: Option<Delivery>,
    in_flight: Option<Delivery>,
    line_no: u64,
}

impl<R: AsyncBufRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self { Self { lines: reader.lines(), pending: None, in_flight: None, line_no: 0 } }
}

#[async_trait::async_trait]
impl<R: AsyncBufRead + Unpin + Send> HeartbeatSource for LineSource<R> {
    async fn recv(&mut self) -> Option<Delivery> {
        if let Some(mut d) = self.pending.take() {
            d.attempt += 1;
            self.in_flight = Some(d.clone());
            return Some(d);
        }
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    self.line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let d = Delivery { tag: self.line_no, key: format!("line:{}", self.line_no), payload: line.into_bytes(), attempt: 1 };
                    self.in_flight = Some(d.clone());
                    return Some(d);
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "heartbeat reader failed; closing source");
                    return None;
                }
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        match self.in_flight.take() {
            Some(d) if d.tag == tag => Ok(()),
            other => {
                self.in_flight = other;
                Err(anyhow!("ack for unknown line {}", tag))
            }
        }
    }

    async fn nack(&mut self, tag: u64) -> Result<()> {
        match self.in_flight.take() {
            Some(d) if d.tag == tag => {
                self.pending = Some(d);
                Ok(())
            }
            other => {
                self.in_flight = other;
                Err(anyhow!("nack for unknown line {}", tag))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_field_names_decode() {
        let raw = br#"{"pod_name":"dev-1","namespace":"ns-2","user_id":2,"start_time":"2024-01-01T00:00:00Z","last_update":"2024-01-01T00:00:30Z"}"#;
        let o = decode_heartbeat(raw).unwrap();
        assert_eq!(o.workload_id, "dev-1");
        assert_eq!((o.observed_at - o.start_time).num_seconds(), 30);
    }

    #[test]
    fn garbage_and_blank_ids_are_malformed() {
        assert!(matches!(decode_heartbeat(b"not json"), Err(MeterError::MalformedObservation(_))));
        let blank = br#"{"workload_id":"","namespace":"ns-2","user_id":2,"start_time":"2024-01-01T00:00:00Z","observed_at":"2024-01-01T00:00:30Z"}"#;
        assert!(matches!(decode_heartbeat(blank), Err(MeterError::MalformedObservation(_))));
    }

    #[tokio::test]
    async fn memory_queue_redelivers_nacked_first() {
        let (tx, mut q) = MemoryQueue::new(8);
        tx.send("a", b"1".to_vec()).await.unwrap();
        tx.send("b", b"2".to_vec()).await.unwrap();
        drop(tx);

        let first = q.recv().await.unwrap();
        q.nack(first.tag).await.unwrap();
        let again = q.recv().await.unwrap();
        assert_eq!(again.payload, b"1");
        assert_eq!(again.attempt, 2);
        q.ack(again.tag).await.unwrap();
        let second = q.recv().await.unwrap();
        assert_eq!(second.key, "b");
        q.ack(second.tag).await.unwrap();
        assert!(q.recv().await.is_none());
        assert!(q.ack(second.tag).await.is_err());

        let c = q.counters();
        assert_eq!((c.delivered(), c.acked(), c.nacked()), (3, 2, 1));
    }

    #[tokio::test]
    async fn line_source_skips_blanks_and_replays_nack() {
        let input: &[u8] = b"{\"a\":1}\n\n{\"b\":2}\n";
        let mut src = LineSource::new(input);
        let d1 = src.recv().await.unwrap();
        src.nack(d1.tag).await.unwrap();
        let d1b = src.recv().await.unwrap();
        assert_eq!((d1b.tag, d1b.attempt), (d1.tag, 2));
        src.ack(d1b.tag).await.unwrap();
        let d2 = src.recv().await.unwrap();
        assert_eq!(d2.payload, b"{\"b\":2}");
        assert_eq!(d2.tag, 3);
        src.ack(d2.tag).await.unwrap();
        assert!(src.recv().await.is_none());
    }
}
