//! Local per-sweep result files kept by each coordinator.
//!
//! Files are named after the sweep (`<kind>_experiment_<sweep id>.csv`) and
//! appended to step by step; a header is written only when the file is new.
use crate::error::{AppResult, DaqError};
use crate::experiment::{CryoSample, MagnetismAcquisition, Step};
use std::path::{Path, PathBuf};

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::experiment::SweepId;
    use std::fs::{File, OpenOptions};
    use tracing::info;

    const CRYO_HEADER: [&str; 7] = [
        "step_id",
        "sample_index",
        "timestamp",
        "elapsed_secs",
        "pressures",
        "resistances",
        "temperatures",
    ];
    const FIELD_HEADER: [&str; 6] = [
        "step_id",
        "sample_index",
        "magnet_field",
        "signal_frequency",
        "ac_rms_field",
        "dc_field",
    ];
    const LOCKIN_HEADER: [&str; 5] = [
        "step_id",
        "sample_index",
        "buffer_index",
        "amplitude",
        "phase",
    ];

    struct SweepFile {
        sweep_id: SweepId,
        writer: csv::Writer<File>,
    }

    /// Appends step results to CSV files under a data directory.
    pub struct ResultRecorder {
        dir: PathBuf,
        cryo: Option<SweepFile>,
        fields: Option<SweepFile>,
        lockin: Option<SweepFile>,
    }

    fn join_values<I: IntoIterator<Item = String>>(values: I) -> String {
        values.into_iter().collect::<Vec<_>>().join(";")
    }

    fn optional(value: Option<f64>) -> String {
        value.map_or_else(String::new, |v| v.to_string())
    }

    impl ResultRecorder {
        /// Recorder writing into `dir`, created on first use.
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self {
                dir: dir.into(),
                cryo: None,
                fields: None,
                lockin: None,
            }
        }

        /// Data directory.
        pub fn dir(&self) -> &Path {
            &self.dir
        }

        /// Path of the file of `kind` for a sweep.
        pub fn file_path(&self, kind: &str, sweep_id: SweepId) -> PathBuf {
            self.dir.join(format!("{kind}_experiment_{sweep_id}.csv"))
        }

        fn writer<'a>(
            dir: &Path,
            slot: &'a mut Option<SweepFile>,
            kind: &str,
            header: &[&str],
            sweep_id: SweepId,
        ) -> AppResult<&'a mut csv::Writer<File>> {
            let stale = slot.as_ref().is_some_and(|f| f.sweep_id != sweep_id);
            if stale {
                if let Some(mut previous) = slot.take() {
                    previous.writer.flush()?;
                }
            }
            if slot.is_none() {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{kind}_experiment_{sweep_id}.csv"));
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                let is_new = file.metadata()?.len() == 0;
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(file);
                if is_new {
                    writer.write_record(header)?;
                }
                info!(path = %path.display(), "Recording {kind} results");
                *slot = Some(SweepFile { sweep_id, writer });
            }
            slot.as_mut()
                .map(|f| &mut f.writer)
                .ok_or_else(|| DaqError::Storage(format!("{kind} result file unavailable")))
        }

        /// Appends the cryogenics samples of a step.
        pub fn record_cryo(&mut self, step: &Step, samples: &[CryoSample]) -> AppResult<()> {
            let writer = Self::writer(
                &self.dir,
                &mut self.cryo,
                "cryo_samples",
                &CRYO_HEADER,
                step.sweep_id,
            )?;
            for (index, sample) in samples.iter().enumerate() {
                writer.write_record(&[
                    step.id.to_string(),
                    index.to_string(),
                    sample.timestamp.to_rfc3339(),
                    sample.elapsed_secs.to_string(),
                    join_values(sample.pressures.iter().map(f64::to_string)),
                    join_values(sample.temperatures.iter().map(|r| optional(r.resistance))),
                    join_values(sample.temperatures.iter().map(|r| optional(r.temperature))),
                ])?;
            }
            writer.flush()?;
            Ok(())
        }

        /// Appends the magnetism samples of a step and their raw lock-in buffers.
        pub fn record_magnetism(
            &mut self,
            step: &Step,
            acquisitions: &[MagnetismAcquisition],
        ) -> AppResult<()> {
            let fields = Self::writer(
                &self.dir,
                &mut self.fields,
                "magnetism_fields",
                &FIELD_HEADER,
                step.sweep_id,
            )?;
            for (index, acquisition) in acquisitions.iter().enumerate() {
                fields.write_record(&[
                    step.id.to_string(),
                    index.to_string(),
                    step.settings.magnet_field.to_string(),
                    step.settings.signal_frequency.to_string(),
                    acquisition.sample.ac_rms_field.to_string(),
                    acquisition.sample.dc_field.to_string(),
                ])?;
            }
            fields.flush()?;

            let lockin = Self::writer(
                &self.dir,
                &mut self.lockin,
                "magnetism_lockin",
                &LOCKIN_HEADER,
                step.sweep_id,
            )?;
            for (index, acquisition) in acquisitions.iter().enumerate() {
                for (buffer_index, (amplitude, phase)) in acquisition
                    .lockin_amplitudes
                    .iter()
                    .zip(&acquisition.lockin_phases)
                    .enumerate()
                {
                    lockin.write_record(&[
                        step.id.to_string(),
                        index.to_string(),
                        buffer_index.to_string(),
                        amplitude.to_string(),
                        phase.to_string(),
                    ])?;
                }
            }
            lockin.flush()?;
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder recorder; every call reports the missing feature.
    pub struct ResultRecorder {
        dir: PathBuf,
    }

    impl ResultRecorder {
        /// Recorder writing into `dir`.
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self { dir: dir.into() }
        }

        /// Data directory.
        pub fn dir(&self) -> &Path {
            &self.dir
        }

        /// Appends the cryogenics samples of a step.
        pub fn record_cryo(&mut self, _step: &Step, _samples: &[CryoSample]) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        /// Appends the magnetism samples of a step.
        pub fn record_magnetism(
            &mut self,
            _step: &Step,
            _acquisitions: &[MagnetismAcquisition],
        ) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::ResultRecorder;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::ResultRecorder;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::experiment::{
        ChannelReading, MagnetismSample, StepId, StepOutcome, SweepConfiguration, SweepId,
    };

    fn step(id: i64, sweep: i64) -> Step {
        Step {
            id: StepId(id),
            sweep_id: SweepId(sweep),
            done: false,
            outcome: StepOutcome::Pending,
            settings: SweepConfiguration::default().generate_steps()[0],
        }
    }

    fn cryo_sample() -> CryoSample {
        CryoSample {
            elapsed_secs: 0.5,
            timestamp: chrono::Utc::now(),
            pressures: vec![1.0, 2.0],
            temperatures: vec![ChannelReading {
                channel: 1,
                resistance: Some(1500.0),
                temperature: Some(4.2),
                stale: false,
            }],
        }
    }

    #[test]
    fn header_is_written_once_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ResultRecorder::new(dir.path());
        recorder.record_cryo(&step(1, 3), &[cryo_sample()]).unwrap();
        recorder
            .record_cryo(&step(2, 3), &[cryo_sample(), cryo_sample()])
            .unwrap();

        // a fresh recorder appends to the same file
        let mut reopened = ResultRecorder::new(dir.path());
        reopened.record_cryo(&step(3, 3), &[cryo_sample()]).unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("cryo_samples_experiment_3.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("step_id"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("step_id")).count(), 1);
    }

    #[test]
    fn new_sweep_switches_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ResultRecorder::new(dir.path());
        let acquisition = MagnetismAcquisition {
            sample: MagnetismSample {
                ac_rms_field: 0.1,
                dc_field: 5.0,
                lockin_amplitude: 1.0,
                lockin_phase: 2.0,
            },
            lockin_amplitudes: vec![1.0, 1.0, 1.0],
            lockin_phases: vec![2.0, 2.0, 2.0],
        };
        recorder
            .record_magnetism(&step(1, 1), &[acquisition.clone()])
            .unwrap();
        recorder.record_magnetism(&step(2, 2), &[acquisition]).unwrap();

        for sweep in [1, 2] {
            let fields = recorder.file_path("magnetism_fields", SweepId(sweep));
            assert_eq!(std::fs::read_to_string(fields).unwrap().lines().count(), 2);
            let lockin = recorder.file_path("magnetism_lockin", SweepId(sweep));
            assert_eq!(std::fs::read_to_string(lockin).unwrap().lines().count(), 4);
        }
    }
}
