//! Daemon subcommands, through the registry and over the socket

mod common;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::SyntheticVolume;
use parking_lot::Mutex;
use sigmet_raw::client::{self, ClientError};
use sigmet_raw::config::{Config, DaemonConfig};
use sigmet_raw::daemon::{CommandRegistry, Daemon, DaemonMetrics, DaemonState, Request, Session};
use sigmet_raw::DataType;
use tempfile::TempDir;

fn small_volume() -> SyntheticVolume {
    SyntheticVolume::new(2, 3, 4, vec![DataType::Dbz, DataType::Zdr], |_, r, t, b| {
        if t == 0 {
            64 + (r + b) as u8
        } else {
            128
        }
    })
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

struct Harness {
    dir: TempDir,
    state: DaemonState,
    registry: CommandRegistry,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            dir: dir.path().to_path_buf(),
            ..DaemonConfig::default()
        };
        Self {
            state: DaemonState::new(&config, Arc::new(DaemonMetrics::new())),
            dir,
            registry: CommandRegistry::new(),
        }
    }

    fn run(&mut self, args: &[&str]) -> (i32, String, String) {
        let out = SharedBuf::default();
        let err = SharedBuf::default();
        let request = Request::new(
            7,
            self.dir.path(),
            args.iter().map(|a| a.to_string()).collect(),
        );
        let mut session = Session::with_writers(
            request,
            Instant::now() + Duration::from_secs(10),
            Box::new(out.clone()),
            Box::new(err.clone()),
        );
        let status = self.registry.dispatch(&mut self.state, &mut session);
        session.finish().unwrap();
        (status, out.text(), err.text())
    }
}

#[test]
fn test_read_list_release() {
    let mut h = Harness::new();
    small_volume().write_to(h.dir.path(), "vol.raw");

    assert_eq!(h.run(&["good", "vol.raw"]).0, 0);
    assert_eq!(h.run(&["read", "vol.raw"]).0, 0);

    let (status, out, _) = h.run(&["list"]);
    assert_eq!(status, 0);
    let line = out.lines().next().unwrap();
    assert!(line.starts_with("1 users | complete | "), "{}", line);
    assert!(line.ends_with("vol.raw"));

    assert_eq!(h.run(&["release", "vol.raw"]).0, 0);
    let (_, out, _) = h.run(&["list"]);
    assert!(out.starts_with("0 users"));
}

#[test]
fn test_queries_do_not_keep_references() {
    let mut h = Harness::new();
    let path = small_volume().write_to(h.dir.path(), "vol.raw");

    let (status, _, _) = h.run(&["sweep_headers", "vol.raw"]);
    assert_eq!(status, 0);
    assert_eq!(h.state.cache.users(&path), Some(0));
    assert_eq!(h.state.cache.loads(), 1);

    h.run(&["ray_headers", "vol.raw"]);
    assert_eq!(h.state.cache.loads(), 1);
}

#[test]
fn test_data_selectors() {
    let mut h = Harness::new();
    small_volume().write_to(h.dir.path(), "vol.raw");

    let (status, out, err) = h.run(&["data", "DB_DBZ", "1", "2", "3", "vol.raw"]);
    assert_eq!(status, 0, "{}", err);
    assert_eq!(out, "DB_DBZ. sweep 1, ray 2, bin 3: 2.500000 \n");

    let (_, out, _) = h.run(&["data", "DBZ", "0", "1", "vol.raw"]);
    assert_eq!(out, "DB_DBZ. sweep 0, ray 1: 0.500000 1.000000 1.500000 2.000000 \n");

    let (_, out, _) = h.run(&["data", "DB_ZDR", "0", "vol.raw"]);
    let lines: Vec<_> = out.lines().collect();
    assert_eq!(lines[0], "DB_ZDR. sweep 0");
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[1], "ray 0: 0.000000 0.000000 0.000000 0.000000 ");

    let (_, out, _) = h.run(&["data", "all", "all", "all", "0", "vol.raw"]);
    assert_eq!(out.lines().filter(|l| l.contains(". sweep")).count(), 4);
    assert!(out.contains("ray 2, bin 0: 1.000000"));
}

#[test]
fn test_data_rejects_bad_selectors() {
    let mut h = Harness::new();
    small_volume().write_to(h.dir.path(), "vol.raw");

    let (status, _, err) = h.run(&["data", "DB_VEL", "vol.raw"]);
    assert_eq!(status, 1);
    assert!(err.contains("not in volume"));

    let (status, _, err) = h.run(&["data", "DB_DBZ", "5", "vol.raw"]);
    assert_eq!(status, 1);
    assert!(err.contains("out of range"));

    let (status, _, err) = h.run(&["data", "NOPE", "vol.raw"]);
    assert_eq!(status, 1);
    assert!(err.contains("NOPE"));
}

#[test]
fn test_vol_hdr_and_bin_outline() {
    let mut h = Harness::new();
    small_volume().write_to(h.dir.path(), "vol.raw");

    let (status, out, _) = h.run(&["vol_hdr", "vol.raw"]);
    assert_eq!(status, 0);
    assert!(out.contains("site_name=\"TESTSITE\"\n"));
    assert!(out.contains("types=\"DB_DBZ DB_ZDR\"\n"));
    assert!(out.contains("num_sweeps=2\n"));
    assert!(out.contains("num_rays=3\n"));
    assert!(out.contains("range_bin0=1000\n"));
    assert!(out.contains("truncated=false\n"));
    assert!(out.contains("start_time=\"2024/05/17 12:00:00.0\""));

    let (status, out, _) = h.run(&["bin_outline", "0", "0", "1", "vol.raw"]);
    assert_eq!(status, 0);
    assert_eq!(out, "0.000000 0.988770 1250.000000 1500.000000\n");
}

#[tokio::test]
async fn test_socket_round_trip() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("rawd");
    let volume = small_volume().write_to(temp.path(), "vol.raw");
    let volume = volume.to_str().unwrap().to_string();

    let daemon = Daemon::start(Config::with_dir(&dir)).await.unwrap();
    let run = tokio::spawn(daemon.run());

    let (status, out) = client::capture(&dir, vec!["read".into(), volume.clone()])
        .await
        .unwrap();
    assert_eq!(status, 0);
    assert!(out.is_empty());

    let (status, out) = client::capture(
        &dir,
        vec!["data".into(), "DB_DBZ".into(), "0".into(), "0".into(), volume.clone()],
    )
    .await
    .unwrap();
    assert_eq!(status, 0);
    assert_eq!(out, "DB_DBZ. sweep 0, ray 0: 0.000000 0.500000 1.000000 1.500000 \n");

    let (status, _) = client::capture(&dir, vec!["no_such_command".into()]).await.unwrap();
    assert_eq!(status, 1);

    let report = client::status(&dir).await.unwrap();
    assert!(report.contains("cache=1/32"), "{}", report);

    client::shutdown(&dir).await.unwrap();
    run.await.unwrap().unwrap();
    assert!(matches!(
        client::capture(&dir, vec!["types".into()]).await,
        Err(ClientError::DaemonNotRunning)
    ));
    assert_no_output_sockets(&dir);
}

fn assert_no_output_sockets(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.ends_with(".1") || name.ends_with(".2")
        })
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}
