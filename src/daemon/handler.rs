//! Request Handler
//!
//! Subcommands the daemon serves, dispatched by name. A handler writes its
//! output to the session and returns the exit status for the client; an
//! error becomes a message on the error channel and status 1.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use chrono::{NaiveDateTime, Timelike};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::volume::{is_data, read_headers, DataType, Volume, VolumeError};

use super::cache::VolumeCache;
use super::metrics::DaemonMetrics;
use super::protocol::STATUS_UNKNOWN_COMMAND;
use super::session::Session;
use super::subprocess::VolumeSource;
use super::timeout::TimeoutPolicy;

/// Status for a command that failed
pub const STATUS_FAILURE: i32 = 1;

/// Everything the handlers share. Owned by the server and lent to one
/// session at a time.
pub struct DaemonState {
    pub cache: VolumeCache,
    pub timeout: TimeoutPolicy,
    pub metrics: Arc<DaemonMetrics>,
    pub started: Instant,
    /// Set by `stop`; the server shuts down after the current session
    pub stop_requested: bool,
}

impl DaemonState {
    pub fn new(config: &DaemonConfig, metrics: Arc<DaemonMetrics>) -> Self {
        Self {
            cache: VolumeCache::new(config.cache_slots),
            timeout: TimeoutPolicy::new(
                config.session_timeout(),
                config.min_timeout(),
                config.max_timeout(),
                config.sample_window,
            ),
            metrics,
            started: Instant::now(),
            stop_requested: false,
        }
    }
}

/// Arguments after the subcommand name
pub type Handler = fn(&mut DaemonState, &[String], &mut Session) -> Result<i32>;

pub struct CommandRegistry {
    handlers: BTreeMap<&'static str, Handler>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut handlers: BTreeMap<&'static str, Handler> = BTreeMap::new();
        handlers.insert("types", types);
        handlers.insert("good", good);
        handlers.insert("read", read);
        handlers.insert("reload", reload);
        handlers.insert("release", release);
        handlers.insert("list", list);
        handlers.insert("vol_hdr", vol_hdr);
        handlers.insert("ray_headers", ray_headers);
        handlers.insert("sweep_headers", sweep_headers);
        handlers.insert("data", data);
        handlers.insert("bin_outline", bin_outline);
        handlers.insert("timeout", timeout);
        handlers.insert("status", status);
        handlers.insert("stop", stop);
        Self { handlers }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Run the session's command and return its exit status
    pub fn dispatch(&self, state: &mut DaemonState, session: &mut Session) -> i32 {
        let args = session.args.clone();
        let Some((name, rest)) = args.split_first() else {
            let _ = writeln!(session.err(), "No subcommand given");
            return STATUS_UNKNOWN_COMMAND;
        };

        let Some(handler) = self.handlers.get(name.as_str()) else {
            state.metrics.unknown_commands.inc();
            warn!("Unknown subcommand {:?} from pid {}", name, session.pid);
            let names: Vec<_> = self.names().collect();
            let _ = writeln!(
                session.err(),
                "No subcommand named {}. Subcommands are: {}",
                name,
                names.join(" ")
            );
            return STATUS_UNKNOWN_COMMAND;
        };

        debug!("pid {} running {} {:?}", session.pid, name, rest);
        match handler(state, rest, session) {
            Ok(status) => status,
            Err(e) => {
                debug!("{} failed: {:#}", name, e);
                let _ = writeln!(session.err(), "{} failed: {:#}", name, e);
                STATUS_FAILURE
            }
        }
    }
}

fn usage(cmd: &str, form: &str) -> anyhow::Error {
    anyhow!("Usage: {} {}", cmd, form)
}

/// Acquire the volume at `path` for the length of `f`
fn with_volume<T>(
    state: &mut DaemonState,
    session: &mut Session,
    path: &str,
    f: impl FnOnce(&Volume, &mut Session) -> Result<T>,
) -> Result<T> {
    let path = session.resolve(path);
    let handle = state.cache.acquire(&path, Some(session.deadline()))?;
    let result = match state.cache.get(handle) {
        Some(vol) => f(vol, session),
        None => Err(anyhow!("{} is no longer cached", path.display())),
    };
    state.cache.release_handle(handle);
    result
}

fn format_time(time: Option<NaiveDateTime>) -> String {
    match time {
        Some(t) => {
            let sec = f64::from(t.second()) + f64::from(t.nanosecond()) / 1.0e9;
            format!("{}{:04.1}", t.format("%Y/%m/%d %H:%M:"), sec)
        }
        None => "unknown time".to_string(),
    }
}

// ============ Channel table ============

fn types(_: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    if !args.is_empty() {
        return Err(usage("types", ""));
    }
    let out = session.out();
    for t in DataType::ALL {
        writeln!(out, "{} | {} | {}", t.abbrev(), t.descr(), t.unit())?;
    }
    Ok(0)
}

/// Status 0 if the file starts with valid headers. Prints nothing.
fn good(_: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [path] = args else {
        return Err(usage("good", "sigmet_volume"));
    };
    let path = session.resolve(path);
    let status = match VolumeSource::open(&path) {
        Ok(mut source) => match read_headers(&mut source) {
            Ok(_) => 0,
            Err(e) => {
                debug!("{} is not a good volume: {}", path.display(), e);
                STATUS_FAILURE
            }
        },
        Err(e) => {
            debug!("Could not open {}: {}", path.display(), e);
            STATUS_FAILURE
        }
    };
    Ok(status)
}

// ============ Cache ============

fn read(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [path] = args else {
        return Err(usage("read", "sigmet_volume"));
    };
    let path = session.resolve(path);
    state.cache.acquire(&path, Some(session.deadline()))?;
    Ok(0)
}

fn reload(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [path] = args else {
        return Err(usage("reload", "sigmet_volume"));
    };
    let path = session.resolve(path);
    state.cache.reload(&path, Some(session.deadline()))?;
    Ok(0)
}

fn release(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [path] = args else {
        return Err(usage("release", "sigmet_volume"));
    };
    state.cache.release(&session.resolve(path));
    Ok(0)
}

fn list(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    if !args.is_empty() {
        return Err(usage("list", ""));
    }
    let out = session.out();
    for e in state.cache.list() {
        writeln!(
            out,
            "{} users | {} | {} {} | {}",
            e.users,
            if e.truncated { "truncated" } else { "complete" },
            e.id.dev,
            e.id.ino,
            e.path.display()
        )?;
    }
    Ok(0)
}

// ============ Volume queries ============

fn vol_hdr(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [path] = args else {
        return Err(usage("vol_hdr", "sigmet_volume"));
    };
    with_volume(state, session, path, |vol, session| {
        let h = vol.headers();
        let ic = &h.ingest.config;
        let dsp = &h.ingest.task.dsp;
        let types: Vec<_> = vol.channels().iter().map(|t| t.abbrev()).collect();
        let out = session.out();

        writeln!(out, "site_name=\"{}\"", h.product.end.site_name)?;
        writeln!(out, "task_name=\"{}\"", h.product.config.task_name)?;
        writeln!(out, "scan_mode=\"{}\"", h.ingest.task.scan.scan.mode_name())?;
        writeln!(out, "types=\"{}\"", types.join(" "))?;
        writeln!(out, "num_sweeps={}", h.num_sweeps())?;
        writeln!(out, "sweeps_read={}", vol.sweep_count())?;
        writeln!(out, "num_rays={}", vol.rays_per_sweep())?;
        writeln!(out, "num_bins={}", vol.bins_per_ray())?;
        writeln!(out, "range_bin0={}", h.range_first_bin_m())?;
        writeln!(out, "bin_step={}", h.bin_step_m())?;
        writeln!(out, "radar_lon={:.6}", ic.longitude_rad().to_degrees())?;
        writeln!(out, "radar_lat={:.6}", ic.latitude_rad().to_degrees())?;
        writeln!(out, "prf={}", dsp.prf)?;
        writeln!(out, "prf_mode=\"{}\"", dsp.multi_prf.label())?;
        writeln!(out, "wavelength={}", h.wavelength_m())?;
        match vol.nyquist_velocity() {
            Some(v) => writeln!(out, "vel_ny={}", v)?,
            None => writeln!(out, "vel_ny=unknown")?,
        }
        writeln!(out, "truncated={}", vol.is_truncated())?;
        writeln!(out, "start_time=\"{}\"", format_time(ic.volume_start.to_datetime()))?;
        Ok(0)
    })
}

fn ray_headers(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [path] = args else {
        return Err(usage("ray_headers", "sigmet_volume"));
    };
    with_volume(state, session, path, |vol, session| {
        let out = session.out();
        for s in 0..vol.sweep_count() {
            for r in 0..vol.rays_per_sweep() {
                let ray = vol.ray(s, r)?;
                if !ray.ok {
                    continue;
                }
                writeln!(
                    out,
                    "sweep {:3} ray {:4} | {} | az {:7.3} {:7.3} | tilt {:6.3} {:6.3} | bins {}",
                    s,
                    r,
                    format_time(ray.time),
                    ray.az0.to_degrees(),
                    ray.az1.to_degrees(),
                    ray.tilt0.to_degrees(),
                    ray.tilt1.to_degrees(),
                    ray.num_bins
                )?;
            }
        }
        Ok(0)
    })
}

fn sweep_headers(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [path] = args else {
        return Err(usage("sweep_headers", "sigmet_volume"));
    };
    with_volume(state, session, path, |vol, session| {
        let out = session.out();
        for s in 0..vol.sweep_count() {
            let sweep = vol.sweep(s)?;
            writeln!(
                out,
                "sweep {:2} | {} | {} | angle {:7.3}",
                s,
                if sweep.ok { "good" } else { "bad" },
                format_time(sweep.time),
                sweep.angle.to_degrees()
            )?;
        }
        Ok(0)
    })
}

/// `None` selects every index
fn parse_selector(arg: &str, what: &str) -> Result<Option<usize>> {
    if arg.eq_ignore_ascii_case("all") || arg == "*" {
        return Ok(None);
    }
    arg.parse()
        .map(Some)
        .map_err(|_| anyhow!("{} index must be a non-negative integer or all, got {}", what, arg))
}

fn select(sel: Option<usize>, count: usize) -> std::ops::Range<usize> {
    match sel {
        Some(i) => i..i + 1,
        None => 0..count,
    }
}

fn write_value(out: &mut dyn Write, v: f32) -> std::io::Result<()> {
    if is_data(v) {
        write!(out, "{:.6} ", v)
    } else {
        write!(out, "nodat ")
    }
}

/// `data [TYPE [SWEEP [RAY [BIN]]]] PATH`
fn data(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let Some((path, selectors)) = args.split_last() else {
        return Err(usage("data", "[type|all] [sweep|all] [ray|all] [bin|all] sigmet_volume"));
    };
    if selectors.len() > 4 {
        return Err(usage("data", "[type|all] [sweep|all] [ray|all] [bin|all] sigmet_volume"));
    }
    let type_sel = match selectors.first() {
        Some(t) if t.eq_ignore_ascii_case("all") || t == "*" => None,
        Some(t) => Some(t.parse::<DataType>()?),
        None => None,
    };
    let pick = |i: usize, what: &str| -> Result<Option<usize>> {
        selectors.get(i).map_or(Ok(None), |a| parse_selector(a, what))
    };
    let s_sel = pick(1, "Sweep")?;
    let r_sel = pick(2, "Ray")?;
    let b_sel = pick(3, "Bin")?;

    with_volume(state, session, path, |vol, session| {
        let channels: Vec<(usize, DataType)> = match type_sel {
            Some(t) => {
                let c = vol
                    .channel_index(t)
                    .ok_or_else(|| anyhow!("Data type {} not in volume", t))?;
                vec![(c, t)]
            }
            None => vol.channels().iter().copied().enumerate().collect(),
        };
        if let Some(s) = s_sel {
            vol.sweep(s)?;
        }
        if let Some(r) = r_sel {
            if r >= vol.rays_per_sweep() {
                bail!(VolumeError::IndexOutOfRange { what: "ray", index: r, count: vol.rays_per_sweep() });
            }
        }
        if let Some(b) = b_sel {
            if b >= vol.bins_per_ray() {
                bail!(VolumeError::IndexOutOfRange { what: "bin", index: b, count: vol.bins_per_ray() });
            }
        }

        for &(c, t) in &channels {
            for s in select(s_sel, vol.sweep_count()) {
                if session.expired() {
                    bail!(VolumeError::DeadlineExceeded);
                }
                let out = session.out();
                if r_sel.is_none() {
                    writeln!(out, "{}. sweep {}", t, s)?;
                }
                for r in select(r_sel, vol.rays_per_sweep()) {
                    let Some(values) = vol.ray_values(c, s, r)? else {
                        continue;
                    };
                    match (r_sel, b_sel) {
                        (None, None) => write!(out, "ray {}: ", r)?,
                        (None, Some(b)) => write!(out, "ray {}, bin {}: ", r, b)?,
                        (Some(_), None) => write!(out, "{}. sweep {}, ray {}: ", t, s, r)?,
                        (Some(_), Some(b)) => write!(out, "{}. sweep {}, ray {}, bin {}: ", t, s, r, b)?,
                    }
                    match b_sel {
                        Some(b) => write_value(out, vol.value(c, s, r, b)?)?,
                        None => {
                            for &v in values {
                                write_value(out, v)?;
                            }
                        }
                    }
                    writeln!(out)?;
                }
            }
        }
        Ok(0)
    })
}

/// Azimuths in degrees, ranges in metres
fn bin_outline(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    let [s, r, b, path] = args else {
        return Err(usage("bin_outline", "sweep ray bin sigmet_volume"));
    };
    let index = |arg: &str, what: &str| -> Result<usize> {
        arg.parse()
            .map_err(|_| anyhow!("{} index must be a non-negative integer, got {}", what, arg))
    };
    let (s, r, b) = (index(s, "Sweep")?, index(r, "Ray")?, index(b, "Bin")?);
    with_volume(state, session, path, |vol, session| {
        let o = vol.bin_outline(s, r, b)?;
        writeln!(
            session.out(),
            "{:.6} {:.6} {:.6} {:.6}",
            o.az0.to_degrees(),
            o.az1.to_degrees(),
            o.r0,
            o.r1
        )?;
        Ok(0)
    })
}

// ============ Daemon control ============

fn timeout(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    match args {
        [] => {}
        [secs] => {
            let secs: u64 = secs
                .parse()
                .map_err(|_| anyhow!("Timeout must be a whole number of seconds, got {}", secs))?;
            let budget = state.timeout.set_budget(Duration::from_secs(secs));
            info!("Session timeout set to {:?}", budget);
        }
        _ => return Err(usage("timeout", "[seconds]")),
    }
    writeln!(session.out(), "{}", state.timeout.budget().as_secs())?;
    Ok(0)
}

fn status(state: &mut DaemonState, args: &[String], session: &mut Session) -> Result<i32> {
    if !args.is_empty() {
        return Err(usage("status", ""));
    }
    state.metrics.update_memory_usage();
    let m = state.metrics.snapshot();
    let out = session.out();
    writeln!(out, "uptime_secs={}", state.started.elapsed().as_secs())?;
    writeln!(out, "sessions={}", m.sessions_total)?;
    writeln!(out, "sessions_failed={}", m.sessions_failed)?;
    writeln!(out, "sessions_dropped={}", m.sessions_dropped)?;
    writeln!(out, "timeouts={}", m.sessions_timed_out)?;
    writeln!(out, "unknown_commands={}", m.unknown_commands)?;
    writeln!(out, "connections={} active={}", m.connections_total, m.active_connections)?;
    writeln!(
        out,
        "session_latency_ms mean={:.3} max={:.3}",
        m.session_latency_ms, m.session_latency_max_ms
    )?;
    writeln!(out, "timeout_secs={}", state.timeout.budget().as_secs())?;
    writeln!(
        out,
        "cache={}/{} loads={}",
        state.cache.occupied(),
        state.cache.capacity(),
        state.cache.loads()
    )?;
    writeln!(out, "memory_bytes={}", m.memory_usage_bytes)?;
    Ok(0)
}

fn stop(state: &mut DaemonState, args: &[String], _: &mut Session) -> Result<i32> {
    if !args.is_empty() {
        return Err(usage("stop", ""));
    }
    info!("Stop requested");
    state.stop_requested = true;
    Ok(0)
}
