use embedded_hal_async::delay::DelayNs;
use rand_core::RngCore;
use tofcast_core::record::GRID_SIDE;
use tofcast_core::{MeasurementRecord, ObjectMap};

use crate::Error;
use crate::assembler::CaptureAssembler;
use crate::sensor::{Sensor, SensorError};
use crate::transport::{Broadcaster, FragmentTransmitter, SendReport};

/// Outcome of one sampling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// The capture was folded; the record is not complete yet.
    Folded { sub_capture: u8 },
    /// The fourth capture completed a record and it went on air.
    Sent(SendReport),
}

/// The emitter's sampling loop: wait, fetch, fold and, every fourth capture,
/// transmit. Sampling pauses while a record is being transmitted.
pub struct Engine<S, B, D, R> {
    sensor: S,
    assembler: CaptureAssembler,
    transmitter: FragmentTransmitter<B, D, R>,
}

impl<S, B, D, R> Engine<S, B, D, R>
where
    S: Sensor,
    B: Broadcaster,
    D: DelayNs,
    R: RngCore,
{
    pub fn new(sensor: S, transmitter: FragmentTransmitter<B, D, R>) -> Self {
        Self {
            sensor,
            assembler: CaptureAssembler::new(),
            transmitter,
        }
    }

    pub fn transmitter_mut(&mut self) -> &mut FragmentTransmitter<B, D, R> {
        &mut self.transmitter
    }

    pub fn into_parts(self) -> (S, FragmentTransmitter<B, D, R>) {
        (self.sensor, self.transmitter)
    }

    pub async fn step(&mut self) -> Result<Step, Error> {
        self.sensor.wait_for_capture().await?;
        let capture = self.sensor.sample_fetch().await?;

        match self.assembler.fold(&capture)? {
            None => Ok(Step::Folded {
                sub_capture: capture.sub_capture,
            }),
            Some(record) => {
                log_record(&record);
                Ok(Step::Sent(self.transmitter.send(&record).await?))
            }
        }
    }

    /// Sample until the sensor fails.
    ///
    /// Transport and sequencing errors drop the affected record and sampling
    /// continues; the first sensor error is returned to the caller.
    pub async fn run(&mut self) -> SensorError {
        loop {
            match self.step().await {
                Ok(Step::Sent(report)) => {
                    info!("record sent as session {}", report.session_id);
                }
                Ok(Step::Folded { .. }) => {}
                Err(Error::Sensor(e)) => {
                    error!("sensor failure: {:?}", e);
                    return e;
                }
                Err(e) => {
                    warn!("record dropped: {:?}", e);
                }
            }
        }
    }
}

/// Distances of `map`, one array per grid row.
pub fn distance_rows(map: &ObjectMap) -> [[u16; GRID_SIDE]; GRID_SIDE] {
    let mut rows = [[0u16; GRID_SIDE]; GRID_SIDE];
    for (row, zones) in rows.iter_mut().zip(map.chunks_exact(GRID_SIDE)) {
        for (distance, zone) in row.iter_mut().zip(zones) {
            *distance = zone.distance_mm;
        }
    }
    rows
}

fn log_record(record: &MeasurementRecord) {
    info!(
        "record {}: temp {} valid {} ambient {} photons {} reference {} systick {}",
        record.result_number,
        record.temperature,
        record.valid_results,
        record.ambient_light,
        record.photon_count,
        record.reference_count,
        record.sys_tick_sec,
    );
    for (name, map) in [
        ("map1", &record.object_map_1),
        ("map2", &record.object_map_2),
    ] {
        for (row, distances) in distance_rows(map).iter().enumerate() {
            debug!("{} row {}: {:?}", name, row, distances);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tofcast_core::Zone;

    use super::*;
    use crate::assembler::AssemblyError;
    use crate::sensor::RawCapture;
    use crate::sensor::registers::RESULT_SLOTS;
    use crate::transport::{TransmitterConfig, TransportError};

    struct ScriptedSensor {
        captures: VecDeque<Result<RawCapture, SensorError>>,
    }

    impl ScriptedSensor {
        fn new(script: impl IntoIterator<Item = Result<RawCapture, SensorError>>) -> Self {
            Self {
                captures: script.into_iter().collect(),
            }
        }
    }

    impl Sensor for ScriptedSensor {
        async fn wait_for_capture(&mut self) -> Result<(), SensorError> {
            Ok(())
        }

        async fn sample_fetch(&mut self) -> Result<RawCapture, SensorError> {
            self.captures.pop_front().unwrap_or(Err(SensorError::Read))
        }
    }

    #[derive(Clone, Default)]
    struct SharedRadio {
        payloads: Rc<RefCell<Vec<Vec<u8>>>>,
        down: Rc<RefCell<bool>>,
    }

    impl Broadcaster for SharedRadio {
        async fn set_payload(&mut self, adv: &[u8]) -> Result<(), TransportError> {
            if *self.down.borrow() {
                return Err(TransportError::Unavailable);
            }
            self.payloads.borrow_mut().push(adv.to_vec());
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    fn capture(sub_capture: u8) -> Result<RawCapture, SensorError> {
        Ok(RawCapture {
            sub_capture,
            result_number: 1,
            temperature: 20,
            valid_results: 32,
            ambient_light: 1,
            photon_count: 2,
            reference_count: 3,
            sys_tick_sec: 0.5,
            results: [Zone::new(50, 300); RESULT_SLOTS],
        })
    }

    fn engine(
        script: impl IntoIterator<Item = Result<RawCapture, SensorError>>,
        radio: &SharedRadio,
    ) -> Engine<ScriptedSensor, SharedRadio, NoDelay, StdRng> {
        let mut transmitter = FragmentTransmitter::new(
            TransmitterConfig::default(),
            NoDelay,
            StdRng::seed_from_u64(11),
        )
        .unwrap();
        transmitter.attach(radio.clone());
        Engine::new(ScriptedSensor::new(script), transmitter)
    }

    #[tokio::test]
    async fn fourth_capture_sends_the_record() {
        let radio = SharedRadio::default();
        let mut engine = engine((0..4).map(capture), &radio);

        for sub in 0..3 {
            assert_eq!(
                engine.step().await.unwrap(),
                Step::Folded { sub_capture: sub }
            );
        }
        let Step::Sent(report) = engine.step().await.unwrap() else {
            panic!("record not sent");
        };

        assert_eq!(report.parts, 3);
        assert_eq!(radio.payloads.borrow().len(), 3);
    }

    #[test]
    fn distance_rows_follow_row_major_cells() {
        let mut map = [Zone::EMPTY; tofcast_core::ZONES_PER_MAP];
        for (cell, zone) in map.iter_mut().enumerate() {
            *zone = Zone::new(1, cell as u16 * 10);
        }

        let rows = distance_rows(&map);

        assert_eq!(rows[0], [0, 10, 20, 30, 40, 50, 60, 70]);
        assert_eq!(rows[7][7], 630);
    }

    #[tokio::test]
    async fn out_of_sequence_capture_surfaces_as_assembly_error() {
        let radio = SharedRadio::default();
        let mut engine = engine([capture(0), capture(2)], &radio);

        engine.step().await.unwrap();
        assert!(matches!(
            engine.step().await,
            Err(Error::Assembly(AssemblyError::OutOfSequence {
                expected: 1,
                actual: 2
            }))
        ));
    }

    #[tokio::test]
    async fn run_survives_transport_errors_and_stops_on_sensor_error() {
        let radio = SharedRadio::default();
        *radio.down.borrow_mut() = true;

        let script = (0..4)
            .map(capture)
            .chain([capture(3)])
            .chain((0..4).map(capture))
            .chain([Err(SensorError::Communication)]);
        let mut engine = engine(script, &radio);

        // First record hits the dead radio, the stray capture is rejected.
        let step = engine.step().await;
        assert!(step.is_ok());
        for _ in 0..3 {
            let _ = engine.step().await;
        }
        *radio.down.borrow_mut() = false;

        assert_eq!(engine.run().await, SensorError::Communication);
        assert_eq!(radio.payloads.borrow().len(), 3);
    }
}
