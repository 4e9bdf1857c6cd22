use std::net::TcpListener;
use std::process::Command;
use std::thread;

use gz_core::games::TicTacToe;
use gz_features::{BasesTransformer, PolicyHeads, Transformer};
use gz_infer::codec::{decode_request, encode_response};
use gz_infer::frame::{read_frame, write_frame};
use gz_infer::protocol::BatchResponseV1;

fn gz_bin() -> String {
    env!("CARGO_BIN_EXE_gz").to_string()
}

#[test]
fn help_and_version_run() {
    let out = Command::new(gz_bin()).arg("--help").output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("bench-poll"));

    let out = Command::new(gz_bin()).arg("--version").output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("gz "));
}

#[test]
fn unknown_command_fails() {
    let out = Command::new(gz_bin()).arg("frobnicate").output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Unknown command"));
}

#[test]
fn selfplay_requires_config() {
    let dir = tempfile::tempdir().unwrap();
    let out = Command::new(gz_bin())
        .args(["selfplay", "--out"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Missing --config"));
}

#[test]
fn bench_poll_plays_a_game() {
    let out = Command::new(gz_bin())
        .args(["bench-poll", "--evals", "40", "--batch", "4"])
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(s.contains("bench-poll: game=tictactoe evals=40 batch=4"));
    assert!(s.contains("max_fill="));
}

#[test]
fn bench_poll_rejects_zero_batch() {
    let out = Command::new(gz_bin())
        .args(["bench-poll", "--batch", "0"])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn selfplay_writes_manifest_and_logs() {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let channel_len = t.channel_len();
    let role_count = t.role_count();
    let policy_len = t.policy_len(0);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut sock, _peer) = listener.accept().unwrap();
        while let Ok(payload) = read_frame(&mut sock) {
            let req = decode_request(&payload).unwrap();
            assert_eq!(req.channel_len as usize, channel_len);
            let n = req.count as usize;
            let resp = BatchResponseV1 {
                batch_id: req.batch_id,
                count: req.count,
                role_count: role_count as u32,
                policy_lens: vec![policy_len as u32],
                policies: vec![vec![1.0 / policy_len as f32; n * policy_len]],
                final_values: vec![0.5; n * role_count],
            };
            if write_frame(&mut sock, &encode_response(&resp)).is_err() {
                break;
            }
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join("cfg.yaml");
    std::fs::write(
        &cfg,
        "selfplay:\n  evals_per_move: 16\n  resign0_pct: 0.0\n  resign1_pct: 0.0\n",
    )
    .unwrap();
    let run_dir = dir.path().join("run1");

    let out = Command::new(gz_bin())
        .arg("selfplay")
        .arg("--config")
        .arg(&cfg)
        .arg("--infer")
        .arg(format!("tcp://{addr}"))
        .arg("--out")
        .arg(&run_dir)
        .args(["--games", "2", "--seed", "5"])
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    server.join().unwrap();

    let manifest = gz_logging::read_manifest(run_dir.join("run.json")).unwrap();
    assert_eq!(manifest.run_id, "run1");
    assert_eq!(manifest.game, "tictactoe");
    assert_eq!(manifest.games_requested, 2);
    assert_eq!(manifest.selfplay_games_completed, 2);
    assert!(manifest.finished_ts_ms.is_some());
    assert!(manifest.config_hash.is_some());

    let games = std::fs::read_to_string(run_dir.join("logs/games.ndjson")).unwrap();
    let games: Vec<gz_logging::SelfPlayGameEventV1> = games
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(games.len(), 2);
    assert_eq!(games[0].game_id, 0);
    assert_eq!(games[1].seed, 6);
    assert!(games.iter().all(|g| g.end == "terminal"));
    let samples: u64 = games.iter().map(|g| u64::from(g.samples)).sum();
    assert_eq!(manifest.samples_recorded, samples);

    let moves = std::fs::read_to_string(run_dir.join("logs/moves.ndjson")).unwrap();
    let plies: u32 = games.iter().map(|g| g.game_depth).sum();
    assert_eq!(moves.lines().count() as u32, plies);
}
