use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tofcast_core::adv::{
    AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_MANUFACTURER_DATA, AdvBuilder, MAX_ADV_LEN,
    encode_advertisement,
};
use tofcast_core::fragment::MAX_PAYLOAD_LIMIT;
use tofcast_core::record::GRID_SIDE;
use tofcast_core::{Chunking, MeasurementRecord, ProtocolError, SessionId, Zone};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{BdAddr, Observation, ObservationSource};

/// Address the simulated emitter broadcasts from.
pub const MOCK_EMITTER: BdAddr = BdAddr([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01]);

/// Encode `record` into the advertisements an emitter puts on air, in part order.
pub fn record_advertisements(
    record: &MeasurementRecord,
    session_id: SessionId,
    chunking: Chunking,
    device_name: &str,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let bytes = record.to_bytes();
    let mut frame = [0u8; MAX_PAYLOAD_LIMIT];
    let mut adv = [0u8; MAX_ADV_LEN];

    chunking
        .fragments(session_id, &bytes)?
        .map(|fragment| -> Result<Vec<u8>, ProtocolError> {
            let len = fragment.encode(&mut frame)?;
            let payload = encode_advertisement(&mut adv, &frame[..len], device_name)?;
            Ok(payload.to_vec())
        })
        .collect()
}

/// Simulates an emitter in range plus unrelated devices advertising nearby.
pub struct MockObservationSource {
    device_name: String,
    chunking: Chunking,
    interval: Duration,
    repeats: usize,
    noise_devices: usize,
}

impl MockObservationSource {
    pub fn new(
        device_name: impl Into<String>,
        payload_limit: usize,
        interval_ms: u64,
        repeats: usize,
        noise_devices: usize,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            device_name: device_name.into(),
            chunking: Chunking::for_payload_limit(payload_limit)?,
            interval: Duration::from_millis(interval_ms.max(1)),
            repeats: repeats.max(1),
            noise_devices,
        })
    }
}

/// A record whose distances drift with `seq`, so consecutive records differ.
fn synthetic_record(seq: u32, rng: &mut StdRng) -> MeasurementRecord {
    let mut record = MeasurementRecord {
        result_number: (seq % 64) as u8,
        temperature: rng.random_range(18..30),
        valid_results: 128,
        ambient_light: rng.random_range(0..5_000),
        photon_count: rng.random_range(10_000..60_000),
        reference_count: rng.random_range(1_000..9_000),
        sys_tick_sec: seq as f32 * 0.25,
        ..MeasurementRecord::default()
    };

    for (map_no, map) in [&mut record.object_map_1, &mut record.object_map_2]
        .into_iter()
        .enumerate()
    {
        for (cell, zone) in map.iter_mut().enumerate() {
            let (row, col) = (cell / GRID_SIDE, cell % GRID_SIDE);
            let distance = 400 + ((row * col) as u32 * 13 + seq * 7 + map_no as u32 * 50) % 1600;
            *zone = Zone::new(rng.random_range(20..=255), distance as u16);
        }
    }

    record
}

fn noise_advertisement(device: usize, rng: &mut StdRng) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = [0u8; 12];
    rng.fill(&mut payload[..]);
    let name = format!("noise-{device}");

    let mut buf = [0u8; MAX_ADV_LEN];
    let mut builder = AdvBuilder::new(&mut buf);
    builder
        .push(AD_TYPE_MANUFACTURER_DATA, &payload)?
        .push(AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes())?;
    Ok(builder.finish().to_vec())
}

#[async_trait]
impl ObservationSource for MockObservationSource {
    type Error = ProtocolError;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Observation>, Self::Error> {
        let (tx, rx) = mpsc::channel(100);

        let device_name = self.device_name.clone();
        let chunking = self.chunking;
        let interval = self.interval;
        let repeats = self.repeats;
        let noise_devices = self.noise_devices;

        info!(
            %device_name,
            interval_ms = interval.as_millis() as u64,
            repeats,
            noise_devices,
            "Starting mock observation source"
        );

        tokio::spawn(async move {
            let mut rng = StdRng::from_os_rng();
            let mut ticker = tokio::time::interval(interval);
            let mut last_session: Option<SessionId> = None;
            let mut seq = 0u32;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Mock observation source shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let session_id = loop {
                            let id = SessionId(rng.random());
                            if Some(id) != last_session {
                                break id;
                            }
                        };
                        last_session = Some(session_id);

                        let record = synthetic_record(seq, &mut rng);
                        seq = seq.wrapping_add(1);

                        let mut batch = Vec::new();
                        let parts = match record_advertisements(
                            &record,
                            session_id,
                            chunking,
                            &device_name,
                        ) {
                            Ok(parts) => parts,
                            Err(e) => {
                                error!(error = %e, "Failed to fragment mock record");
                                continue;
                            }
                        };
                        for part in parts {
                            for _ in 0..repeats {
                                batch.push(Observation {
                                    address: MOCK_EMITTER,
                                    rssi: rng.random_range(-75..-40),
                                    data: part.clone().into_boxed_slice(),
                                });
                            }
                            for device in 0..noise_devices {
                                let Ok(data) = noise_advertisement(device, &mut rng) else {
                                    continue;
                                };
                                batch.push(Observation {
                                    address: BdAddr([0x02, 0x00, 0x00, 0x00, 0x00, device as u8]),
                                    rssi: rng.random_range(-95..-60),
                                    data: data.into_boxed_slice(),
                                });
                            }
                        }

                        debug!(
                            session = %session_id,
                            observations = batch.len(),
                            "Emitting mock record"
                        );
                        for observation in batch {
                            if tx.send(observation).await.is_err() {
                                info!("Channel closed, mock observation source shutting down");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use tofcast_core::adv::Advertisement;
    use tofcast_core::{Fragment, RECORD_SIZE};

    use super::*;

    #[test]
    fn advertisements_carry_every_chunk_in_order() {
        let mut rng = StdRng::seed_from_u64(4);
        let record = synthetic_record(3, &mut rng);

        let ads =
            record_advertisements(&record, SessionId(0x0102), Chunking::default(), "tof").unwrap();

        assert_eq!(ads.len(), 3);
        let mut bytes = Vec::new();
        for ad in &ads {
            let adv = Advertisement::parse(ad).unwrap();
            assert!(adv.is_named("tof"));
            let fragment = Fragment::from_bytes(adv.manufacturer_data.unwrap()).unwrap();
            bytes.extend_from_slice(fragment.chunk);
        }
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(MeasurementRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn noise_is_named_after_its_device() {
        let mut rng = StdRng::seed_from_u64(1);
        let ad = noise_advertisement(2, &mut rng).unwrap();

        let adv = Advertisement::parse(&ad).unwrap();
        assert!(adv.is_named("noise-2"));
        assert_eq!(adv.manufacturer_data.map(<[u8]>::len), Some(12));
    }

    #[tokio::test]
    async fn source_emits_repeated_fragments_and_noise() {
        let source = MockObservationSource::new("tof", 210, 5, 3, 1).unwrap();
        let cancel = CancellationToken::new();
        let mut rx = source.start(cancel.clone()).await.unwrap();

        let mut from_emitter = 0;
        let mut from_noise = 0;
        for _ in 0..8 {
            let observation = rx.recv().await.unwrap();
            if observation.address == MOCK_EMITTER {
                from_emitter += 1;
            } else {
                from_noise += 1;
            }
        }
        cancel.cancel();

        // two parts, each repeated three times and followed by one noise broadcast
        assert_eq!(from_emitter, 6);
        assert_eq!(from_noise, 2);
    }
}
