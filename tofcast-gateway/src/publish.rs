use std::io::{self, Write};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::value::RawValue;
use tofcast_core::{MeasurementRecord, ObjectMap, ZONES_PER_MAP};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::state::GatewayState;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("encoded record exceeds the {limit} byte output buffer")]
    EncodingOverflow { limit: usize },

    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("record timestamp is not a finite number")]
    NonFiniteTimestamp,

    #[error("sink failed: {0}")]
    Sink(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PublishError {
    /// Only a failing sink stops the publish loop; everything else drops one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PublishError::Sink(_))
    }
}

/// The external messaging collaborator.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error>;
}

/// Writes `<topic> <payload>` lines to standard output.
pub struct StdoutSink {
    out: Mutex<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSink for StdoutSink {
    type Error = io::Error;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        let mut out = self.out.lock().await;
        out.write_all(topic.as_bytes()).await?;
        out.write_all(b" ").await?;
        out.write_all(payload).await?;
        out.write_all(b"\n").await?;
        out.flush().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
#[error("message channel closed")]
pub struct SinkClosed;

/// Forwards published messages to an in-process channel.
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    type Error = SinkClosed;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        self.tx
            .send(Message {
                topic: topic.to_owned(),
                payload: payload.to_vec(),
            })
            .await
            .map_err(|_| SinkClosed)
    }
}

/// Caps the number of bytes written into a reusable output buffer.
struct BoundedWriter<'a> {
    buf: &'a mut Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl Write for BoundedWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            self.overflowed = true;
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "output buffer full",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    resno: u8,
    temp: i8,
    valres: u8,
    ambli: u32,
    phocnt: u32,
    refcnt: u32,
    syst: &'a RawValue,
    res: Maps<'a>,
}

#[derive(Serialize)]
struct Maps<'a> {
    map1: &'a [u16],
    map2: &'a [u16],
}

fn distances(map: &ObjectMap) -> [u16; ZONES_PER_MAP] {
    std::array::from_fn(|cell| map[cell].distance_mm)
}

/// Render `record` as JSON into `buf`, never writing more than `limit` bytes.
///
/// Only distances are published; `syst` carries two decimals. On error `buf`
/// is left empty.
pub fn encode_record(
    record: &MeasurementRecord,
    buf: &mut Vec<u8>,
    limit: usize,
) -> Result<(), PublishError> {
    buf.clear();

    if !record.sys_tick_sec.is_finite() {
        return Err(PublishError::NonFiniteTimestamp);
    }
    let syst = RawValue::from_string(format!("{:.2}", record.sys_tick_sec))?;
    let map1 = distances(&record.object_map_1);
    let map2 = distances(&record.object_map_2);

    let payload = Payload {
        resno: record.result_number,
        temp: record.temperature,
        valres: record.valid_results,
        ambli: record.ambient_light,
        phocnt: record.photon_count,
        refcnt: record.reference_count,
        syst: &syst,
        res: Maps {
            map1: &map1,
            map2: &map2,
        },
    };

    let mut writer = BoundedWriter {
        buf: &mut *buf,
        limit,
        overflowed: false,
    };
    let result = serde_json::to_writer(&mut writer, &payload);
    let overflowed = writer.overflowed;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            buf.clear();
            if overflowed {
                Err(PublishError::EncodingOverflow { limit })
            } else {
                Err(e.into())
            }
        }
    }
}

pub struct MeasurementPublisher<S> {
    sink: S,
    topic: String,
    max_payload: usize,
    buf: Vec<u8>,
}

impl<S: MessageSink> MeasurementPublisher<S> {
    pub fn new(sink: S, topic: impl Into<String>, max_payload: usize) -> Self {
        Self {
            sink,
            topic: topic.into(),
            max_payload,
            buf: Vec::with_capacity(max_payload),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encode and forward one record. Nothing reaches the sink if encoding fails.
    pub async fn publish(&mut self, record: &MeasurementRecord) -> Result<(), PublishError> {
        encode_record(record, &mut self.buf, self.max_payload)?;

        self.sink
            .publish(&self.topic, &self.buf)
            .await
            .map_err(|e| PublishError::Sink(Box::new(e)))
    }
}

/// Publish records until cancelled or the sink fails.
///
/// Encoding failures drop the record and the loop goes on; a sink failure is
/// returned to the caller.
#[instrument(name = "publisher", skip_all, fields(topic = %publisher.topic))]
pub async fn run_publisher<S: MessageSink>(
    mut records: mpsc::Receiver<MeasurementRecord>,
    mut publisher: MeasurementPublisher<S>,
    state: GatewayState,
    cancel: CancellationToken,
) -> Result<(), PublishError> {
    info!("Publisher started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Publisher shutting down");
                break;
            }
            record = records.recv() => {
                let Some(record) = record else {
                    info!("Record channel closed");
                    break;
                };

                match publisher.publish(&record).await {
                    Ok(()) => {
                        state.record_published().await;
                        info!(result_number = record.result_number, "Record published");
                    }
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Sink failed, stopping publisher");
                        return Err(e);
                    }
                    Err(e) => {
                        state.record_dropped().await;
                        warn!(error = %e, result_number = record.result_number, "Record dropped");
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tofcast_core::Zone;

    use super::*;

    fn record() -> MeasurementRecord {
        let mut record = MeasurementRecord {
            result_number: 12,
            temperature: -3,
            valid_results: 30,
            ambient_light: 1_000,
            photon_count: 2_000,
            reference_count: 3_000,
            sys_tick_sec: 1.5,
            ..MeasurementRecord::default()
        };
        for (cell, zone) in record.object_map_1.iter_mut().enumerate() {
            *zone = Zone::new(200, cell as u16);
        }
        record.object_map_2[63] = Zone::new(1, 4_000);
        record
    }

    #[test]
    fn record_renders_scalars_and_distances_only() {
        let mut buf = Vec::new();
        encode_record(&record(), &mut buf, 2048).unwrap();

        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with(
            r#"{"resno":12,"temp":-3,"valres":30,"ambli":1000,"phocnt":2000,"refcnt":3000,"syst":1.50,"res":{"map1":[0,1,2,"#
        ));

        let json: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        let map1 = json["res"]["map1"].as_array().unwrap();
        let map2 = json["res"]["map2"].as_array().unwrap();
        assert_eq!(map1.len(), 64);
        assert_eq!(map1[63], 63);
        assert_eq!(map2[0], 0);
        assert_eq!(map2[63], 4000);
    }

    #[test]
    fn syst_is_rounded_to_two_decimals() {
        let mut buf = Vec::new();
        let record = MeasurementRecord {
            sys_tick_sec: 12.3456,
            ..MeasurementRecord::default()
        };
        encode_record(&record, &mut buf, 2048).unwrap();

        assert!(std::str::from_utf8(&buf).unwrap().contains(r#""syst":12.35,"#));
    }

    #[test]
    fn overflow_leaves_nothing_behind() {
        let mut buf = Vec::new();

        let result = encode_record(&record(), &mut buf, 64);

        assert!(matches!(
            result,
            Err(PublishError::EncodingOverflow { limit: 64 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn non_finite_timestamp_is_refused() {
        let record = MeasurementRecord {
            sys_tick_sec: f32::NAN,
            ..MeasurementRecord::default()
        };

        assert!(matches!(
            encode_record(&record, &mut Vec::new(), 2048),
            Err(PublishError::NonFiniteTimestamp)
        ));
    }

    #[tokio::test]
    async fn overflowing_record_is_dropped_and_loop_continues() {
        let (msg_tx, mut msg_rx) = mpsc::channel(4);
        let (record_tx, record_rx) = mpsc::channel(1);
        let state = GatewayState::new();
        let publisher = MeasurementPublisher::new(ChannelSink::new(msg_tx), "tof/record", 550);

        let task = tokio::spawn(run_publisher(
            record_rx,
            publisher,
            state.clone(),
            CancellationToken::new(),
        ));

        let mut wide = record();
        for zone in wide.object_map_2.iter_mut() {
            *zone = Zone::new(9, 65_535);
        }
        record_tx.send(wide).await.unwrap();
        record_tx.send(record()).await.unwrap();
        drop(record_tx);

        task.await.unwrap().unwrap();

        let message = msg_rx.recv().await.unwrap();
        assert_eq!(message.topic, "tof/record");
        assert!(msg_rx.try_recv().is_err());

        let stats = state.stats().await;
        assert_eq!(stats.records_dropped, 1);
        assert_eq!(stats.records_published, 1);
    }

    #[tokio::test]
    async fn closed_sink_stops_the_loop() {
        let (msg_tx, msg_rx) = mpsc::channel(1);
        drop(msg_rx);
        let (record_tx, record_rx) = mpsc::channel(1);
        let publisher = MeasurementPublisher::new(ChannelSink::new(msg_tx), "tof/record", 2048);

        record_tx.send(record()).await.unwrap();
        let result = run_publisher(
            record_rx,
            publisher,
            GatewayState::new(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(PublishError::Sink(_))));
    }
}
