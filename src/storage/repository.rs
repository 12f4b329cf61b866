//! Queries over the experiment tables.

use super::{parse_datetime, Database};
use crate::error::{AppResult, DaqError};
use crate::experiment::{
    ChannelReading, CryoSample, DataPointExport, MagnetismSample, Step, StepExport, StepId,
    StepOutcome, StepSettings, StepSummary, SweepConfiguration, SweepExport, SweepId,
    SweepProgress,
};
use crate::protocol::{ConnectionId, Role};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

const STEP_COLUMNS: &str = "id, sweep_id, done, outcome, lockin_sensitivity, lockin_frequency, \
     lockin_buffer_size, signal_frequency, signal_amplitude, magnet_field, resistor, \
     data_wait_before_measuring, data_points_per_measurement";

/// Result of storing a new sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSweep {
    /// Storage id of the sweep
    pub sweep_id: SweepId,
    /// Steps generated for it
    pub steps: u64,
    /// Pending steps of earlier sweeps that were abandoned
    pub abandoned: u64,
}

/// One row of `client_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSessionRecord {
    /// `role_hwid` identity
    pub idn: String,
    /// Role tag
    pub role: Role,
    /// Current connection, `None` while disconnected
    pub connection_id: Option<ConnectionId>,
    /// First identification (RFC 3339)
    pub first_seen: String,
    /// Latest identification (RFC 3339)
    pub last_seen: String,
}

fn to_u32(value: i64, field: &str) -> AppResult<u32> {
    u32::try_from(value)
        .map_err(|_| DaqError::Storage(format!("{field} contains out of range value {value}")))
}

fn to_u64(value: i64, field: &str) -> AppResult<u64> {
    u64::try_from(value)
        .map_err(|_| DaqError::Storage(format!("{field} contains negative value {value}")))
}

fn to_i64(value: usize) -> AppResult<i64> {
    i64::try_from(value)
        .map_err(|_| DaqError::Storage(format!("value {value} exceeds SQLite INTEGER range")))
}

fn parse_role(value: &str) -> AppResult<Role> {
    match value {
        "cryo" => Ok(Role::Cryo),
        "magnetism" => Ok(Role::Magnetism),
        "webbrowser" => Ok(Role::Browser),
        other => Err(DaqError::Storage(format!("unknown role '{other}'"))),
    }
}

fn row_to_step(row: &Row<'_>) -> AppResult<Step> {
    let outcome: String = row.get("outcome")?;
    Ok(Step {
        id: StepId(row.get("id")?),
        sweep_id: SweepId(row.get("sweep_id")?),
        done: row.get::<_, i64>("done")? != 0,
        outcome: outcome.parse().map_err(DaqError::Storage)?,
        settings: StepSettings {
            lockin_sensitivity: row.get("lockin_sensitivity")?,
            lockin_frequency: row.get("lockin_frequency")?,
            lockin_buffer_size: to_u32(row.get("lockin_buffer_size")?, "lockin_buffer_size")?,
            signal_frequency: row.get("signal_frequency")?,
            signal_amplitude: row.get("signal_amplitude")?,
            magnet_field: row.get("magnet_field")?,
            resistor: row.get("resistor")?,
            data_wait_before_measuring: row.get("data_wait_before_measuring")?,
            data_points_per_measurement: to_u32(
                row.get("data_points_per_measurement")?,
                "data_points_per_measurement",
            )?,
        },
    })
}

fn query_steps(conn: &Connection, sql: &str, id: i64) -> AppResult<Vec<Step>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![id])?;
    let mut steps = Vec::new();
    while let Some(row) = rows.next()? {
        steps.push(row_to_step(row)?);
    }
    Ok(steps)
}

fn ensure_data_point_in(conn: &Connection, step_id: StepId) -> AppResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO data_points (step_id, created) VALUES (?1, ?2)",
        params![step_id.0, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM data_points WHERE step_id = ?1",
        params![step_id.0],
        |row| row.get(0),
    )?)
}

fn magnetism_rows(conn: &Connection, step_id: StepId) -> AppResult<Vec<MagnetismSample>> {
    let mut stmt = conn.prepare(
        "SELECT ac_rms_field, dc_field, lockin_amplitude, lockin_phase
         FROM magnetism_results WHERE step_id = ?1 ORDER BY sample_index",
    )?;
    let rows = stmt.query_map(params![step_id.0], |row| {
        Ok(MagnetismSample {
            ac_rms_field: row.get(0)?,
            dc_field: row.get(1)?,
            lockin_amplitude: row.get(2)?,
            lockin_phase: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn cryogenics_rows(conn: &Connection, step_id: StepId) -> AppResult<Vec<CryoSample>> {
    let mut stmt = conn.prepare(
        "SELECT elapsed_secs, sampled_at, pressures, temperatures
         FROM cryogenics_results WHERE step_id = ?1 ORDER BY sample_index",
    )?;
    let mut rows = stmt.query(params![step_id.0])?;
    let mut samples = Vec::new();
    while let Some(row) = rows.next()? {
        let sampled_at: String = row.get(1)?;
        let pressures: String = row.get(2)?;
        let temperatures: String = row.get(3)?;
        samples.push(CryoSample {
            elapsed_secs: row.get(0)?,
            timestamp: parse_datetime(&sampled_at)?,
            pressures: serde_json::from_str(&pressures)?,
            temperatures: serde_json::from_str::<Vec<ChannelReading>>(&temperatures)?,
        });
    }
    Ok(samples)
}

fn latest_sweep_id(conn: &Connection) -> AppResult<Option<SweepId>> {
    Ok(conn
        .query_row(
            "SELECT id FROM sweep_configurations ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .map(SweepId))
}

impl Database {
    /// Stores a sweep and its generated steps.
    ///
    /// Still-pending steps of earlier sweeps are marked abandoned in the same
    /// transaction.
    pub async fn create_sweep(
        &self,
        config: SweepConfiguration,
        created_by: Option<String>,
    ) -> AppResult<NewSweep> {
        config.validate()?;
        let settings = config.generate_steps();
        let json = serde_json::to_string(&config)?;
        self.execute(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;

            let abandoned = tx.execute(
                "UPDATE steps SET done = 1, outcome = ?1 WHERE done = 0",
                params![StepOutcome::Abandoned.as_str()],
            )?;

            tx.execute(
                "INSERT INTO sweep_configurations (created, created_by, configuration)
                 VALUES (?1, (SELECT idn FROM client_sessions WHERE idn = ?2), ?3)",
                params![now, created_by, json],
            )?;
            let sweep_id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO steps (sweep_id, position, created, lockin_sensitivity,
                        lockin_frequency, lockin_buffer_size, signal_frequency, signal_amplitude,
                        magnet_field, resistor, data_wait_before_measuring,
                        data_points_per_measurement)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )?;
                for (position, s) in settings.iter().enumerate() {
                    stmt.execute(params![
                        sweep_id,
                        to_i64(position)?,
                        now,
                        s.lockin_sensitivity,
                        s.lockin_frequency,
                        s.lockin_buffer_size,
                        s.signal_frequency,
                        s.signal_amplitude,
                        s.magnet_field,
                        s.resistor,
                        s.data_wait_before_measuring,
                        s.data_points_per_measurement,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(NewSweep {
                sweep_id: SweepId(sweep_id),
                steps: settings.len() as u64,
                abandoned: abandoned as u64,
            })
        })
        .await
    }

    /// Oldest step that is not done.
    pub async fn next_pending_step(&self) -> AppResult<Option<Step>> {
        self.execute(|conn| {
            let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE done = 0 ORDER BY id LIMIT 1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let step = match rows.next()? {
                Some(row) => Some(row_to_step(row)?),
                None => None,
            };
            Ok(step)
        })
        .await
    }

    /// Step by id.
    pub async fn step(&self, step_id: StepId) -> AppResult<Option<Step>> {
        self.execute(move |conn| {
            let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1");
            Ok(query_steps(conn, &sql, step_id.0)?.into_iter().next())
        })
        .await
    }

    /// Creates the data point of a step if it does not exist yet; returns its id.
    pub async fn ensure_data_point(&self, step_id: StepId) -> AppResult<i64> {
        self.execute(move |conn| ensure_data_point_in(conn, step_id))
            .await
    }

    /// Moves a pending step to `outcome`.
    ///
    /// Returns false when the step was already done, so a step is completed
    /// at most once.
    pub async fn complete_step(&self, step_id: StepId, outcome: StepOutcome) -> AppResult<bool> {
        if !outcome.is_done() {
            return Err(DaqError::Storage(format!(
                "cannot complete step {step_id} as {outcome}"
            )));
        }
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE steps SET done = 1, outcome = ?1 WHERE id = ?2 AND done = 0",
                params![outcome.as_str(), step_id.0],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Stores magnetism samples; rows that already exist are kept. Returns the rows inserted.
    pub async fn save_magnetism_results(
        &self,
        step_id: StepId,
        samples: Vec<MagnetismSample>,
    ) -> AppResult<usize> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let data_point_id = ensure_data_point_in(&tx, step_id)?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO magnetism_results
                        (data_point_id, step_id, sample_index, ac_rms_field, dc_field,
                         lockin_amplitude, lockin_phase)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for (index, sample) in samples.iter().enumerate() {
                    inserted += stmt.execute(params![
                        data_point_id,
                        step_id.0,
                        to_i64(index)?,
                        sample.ac_rms_field,
                        sample.dc_field,
                        sample.lockin_amplitude,
                        sample.lockin_phase,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    /// Stores cryogenics samples; rows that already exist are kept. Returns the rows inserted.
    pub async fn save_cryogenics_results(
        &self,
        step_id: StepId,
        samples: Vec<CryoSample>,
    ) -> AppResult<usize> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let data_point_id = ensure_data_point_in(&tx, step_id)?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO cryogenics_results
                        (data_point_id, step_id, sample_index, elapsed_secs, sampled_at,
                         pressures, temperatures)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for (index, sample) in samples.iter().enumerate() {
                    inserted += stmt.execute(params![
                        data_point_id,
                        step_id.0,
                        to_i64(index)?,
                        sample.elapsed_secs,
                        sample.timestamp.to_rfc3339(),
                        serde_json::to_string(&sample.pressures)?,
                        serde_json::to_string(&sample.temperatures)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    /// Inserts or refreshes a client session; the idn is the key.
    pub async fn upsert_session(
        &self,
        idn: String,
        role: Role,
        connection: ConnectionId,
    ) -> AppResult<()> {
        let connection_id = i64::try_from(connection.0)
            .map_err(|_| DaqError::Storage(format!("connection id {connection} out of range")))?;
        self.execute(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO client_sessions (idn, role, connection_id, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(idn) DO UPDATE SET
                     role = excluded.role,
                     connection_id = excluded.connection_id,
                     last_seen = excluded.last_seen",
                params![idn, role.prefix(), connection_id, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Clears the connection of a session if it still points at `connection`.
    pub async fn release_session(&self, idn: String, connection: ConnectionId) -> AppResult<()> {
        let connection_id = i64::try_from(connection.0)
            .map_err(|_| DaqError::Storage(format!("connection id {connection} out of range")))?;
        self.execute(move |conn| {
            conn.execute(
                "UPDATE client_sessions SET connection_id = NULL
                 WHERE idn = ?1 AND connection_id = ?2",
                params![idn, connection_id],
            )?;
            Ok(())
        })
        .await
    }

    /// All known client sessions.
    pub async fn sessions(&self) -> AppResult<Vec<ClientSessionRecord>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT idn, role, connection_id, first_seen, last_seen
                 FROM client_sessions ORDER BY idn",
            )?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                let role: String = row.get(1)?;
                let connection_id: Option<i64> = row.get(2)?;
                sessions.push(ClientSessionRecord {
                    idn: row.get(0)?,
                    role: parse_role(&role)?,
                    connection_id: connection_id
                        .map(|id| to_u64(id, "connection_id").map(ConnectionId))
                        .transpose()?,
                    first_seen: row.get(3)?,
                    last_seen: row.get(4)?,
                });
            }
            Ok(sessions)
        })
        .await
    }

    /// Most recently submitted sweep.
    pub async fn latest_sweep(&self) -> AppResult<Option<(SweepId, SweepConfiguration)>> {
        self.execute(|conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, configuration FROM sweep_configurations ORDER BY id DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((id, json)) => Ok(Some((SweepId(id), serde_json::from_str(&json)?))),
                None => Ok(None),
            }
        })
        .await
    }

    /// Progress of `sweep_id`, or of the latest sweep.
    pub async fn sweep_progress(&self, sweep_id: Option<SweepId>) -> AppResult<SweepProgress> {
        self.execute(move |conn| {
            let sweep_id = match sweep_id {
                Some(id) => Some(id),
                None => latest_sweep_id(conn)?,
            };
            let Some(id) = sweep_id else {
                return Ok(SweepProgress {
                    sweep_id: None,
                    taken: 0,
                    total: 0,
                });
            };
            let (total, taken): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(done), 0) FROM steps WHERE sweep_id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(SweepProgress {
                sweep_id: Some(id),
                taken: to_u64(taken, "done")?,
                total: to_u64(total, "steps")?,
            })
        })
        .await
    }

    /// Nested export of a sweep with its steps, data points and results.
    pub async fn export_sweep(&self, sweep_id: SweepId) -> AppResult<Option<SweepExport>> {
        self.execute(move |conn| {
            let header: Option<(String, String)> = conn
                .query_row(
                    "SELECT created, configuration FROM sweep_configurations WHERE id = ?1",
                    params![sweep_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((created, json)) = header else {
                return Ok(None);
            };

            let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE sweep_id = ?1 ORDER BY id");
            let mut steps = Vec::new();
            for step in query_steps(conn, &sql, sweep_id.0)? {
                let data_point_id: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM data_points WHERE step_id = ?1",
                        params![step.id.0],
                        |row| row.get(0),
                    )
                    .optional()?;
                let data_point = match data_point_id {
                    Some(id) => Some(DataPointExport {
                        id,
                        magnetism: magnetism_rows(conn, step.id)?,
                        cryogenics: cryogenics_rows(conn, step.id)?,
                    }),
                    None => None,
                };
                steps.push(StepExport { step, data_point });
            }

            Ok(Some(SweepExport {
                id: sweep_id,
                created: parse_datetime(&created)?,
                configuration: serde_json::from_str(&json)?,
                steps,
            }))
        })
        .await
    }

    /// Per-step means of a sweep, for plotting.
    pub async fn sweep_summary(&self, sweep_id: SweepId) -> AppResult<Option<Vec<StepSummary>>> {
        Ok(self.export_sweep(sweep_id).await?.map(|export| {
            export
                .steps
                .iter()
                .filter_map(|s| {
                    s.data_point.as_ref().map(|dp| {
                        StepSummary::from_samples(&s.step, &dp.magnetism, &dp.cryogenics)
                    })
                })
                .collect()
        }))
    }
}
