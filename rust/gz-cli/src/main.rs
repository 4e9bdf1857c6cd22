//! gz: CLI binary for the ggz search core.
//!
//! Subcommands:
//! - selfplay
//! - bench-poll

use std::env;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::time::{Duration, Instant};

use gz_core::games::TicTacToe;
use gz_core::{BaseState, JointMove, PuctConfig, StateMachine};
use gz_features::{BasesTransformer, PolicyHeads, FEATURE_SCHEMA_ID};
use gz_infer::protocol::PROTOCOL_VERSION;
use gz_infer::{Endpoint, SocketHost, UniformHost};
use gz_runtime::{drive, GameEnd, GameOutcome, Player, SelfPlayer};

const GAME_NAME: &str = "tictactoe";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_help() {
    eprintln!(
        r#"gz - batched PUCT search for general games

USAGE:
    gz <COMMAND> [OPTIONS]

COMMANDS:
    selfplay            Play self-play games against an inference host
    bench-poll          Play one game against an in-process uniform host

OPTIONS:
    -h, --help          Print this help message
    -V, --version       Print version

Run `gz <COMMAND> --help` for command options.
"#
    );
}

fn print_version() {
    println!("gz {}", env!("CARGO_PKG_VERSION"));
}

/// Parse the value following `args[i]`, exiting on a missing or bad value.
fn flag_value<T: FromStr>(args: &[String], i: usize) -> T {
    let flag = &args[i];
    let Some(raw) = args.get(i + 1) else {
        eprintln!("Missing value for {flag}");
        process::exit(1);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Invalid {flag} value: {raw}");
        process::exit(1);
    })
}

fn end_name(end: GameEnd) -> &'static str {
    match end {
        GameEnd::Terminal => "terminal",
        GameEnd::Resigned { .. } => "resigned",
        GameEnd::EarlyLoss { .. } => "early_loss",
        GameEnd::RepetitionDraw => "repetition_draw",
        GameEnd::Aborted => "aborted",
    }
}

/// First role with a choice in `state`; role 0 when nobody has one.
fn lead_role(sm: &dyn StateMachine, state: &BaseState) -> usize {
    (0..sm.role_count())
        .find(|&r| sm.legal_moves(state, r).len() > 1)
        .unwrap_or(0)
}

fn write_move_events(
    w: &mut gz_logging::NdjsonWriter,
    sm: &dyn StateMachine,
    v: &gz_logging::VersionInfoV1,
    run_id: &str,
    game_id: u64,
    out: &GameOutcome,
) -> Result<(), gz_logging::NdjsonError> {
    let mut state = sm.initial_state();
    for (depth, joint) in out.moves.iter().enumerate() {
        let lead = lead_role(sm, &state);
        let lead_move = joint.get(lead);
        w.write_event(&gz_logging::MoveEventV1 {
            event: "move".to_string(),
            ts_ms: gz_logging::now_ms(),
            v: v.clone(),
            run_id: run_id.to_string(),
            game_id,
            game_depth: depth as u32,
            lead_role: lead as u32,
            lead_move,
            move_name: sm.move_name(lead, lead_move),
            sampled: out.samples.iter().any(|s| s.game_depth == depth as u32),
        })?;
        state = sm.next_state(&state, joint);
    }
    Ok(())
}

fn cmd_selfplay(args: &[String]) {
    let mut config_path: Option<String> = None;
    let mut infer: Option<String> = None;
    let mut out: Option<String> = None;
    let mut games: u64 = 10;
    let mut seed: u64 = 0;
    let mut log_flush_every: u64 = 100;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!(
                    r#"gz selfplay

USAGE:
    gz selfplay --config cfg.yaml --out runs/<id>/ [--infer ENDPOINT] [--games N] [--seed S]

OPTIONS:
    --config PATH           Path to YAML config (required)
    --out DIR               Output directory (required)
    --infer ENDPOINT        Inference endpoint (unix:///... or tcp://host:port)
                            (default: inference.endpoint from the config)
    --games N               Number of games to play (default: 10)
    --seed S                Base RNG seed (default: 0)
    --log-flush-every N     Flush NDJSON logs every N lines (0 disables) (default: 100)
"#
                );
                return;
            }
            "--config" => {
                config_path = Some(flag_value(args, i));
                i += 2;
            }
            "--infer" => {
                infer = Some(flag_value(args, i));
                i += 2;
            }
            "--out" => {
                out = Some(flag_value(args, i));
                i += 2;
            }
            "--games" => {
                games = flag_value(args, i);
                i += 2;
            }
            "--seed" => {
                seed = flag_value(args, i);
                i += 2;
            }
            "--log-flush-every" => {
                log_flush_every = flag_value(args, i);
                i += 2;
            }
            other => {
                eprintln!("Unknown option for `gz selfplay`: {}", other);
                eprintln!("Run `gz selfplay --help` for usage.");
                process::exit(1);
            }
        }
    }

    let config_path = config_path.unwrap_or_else(|| {
        eprintln!("Missing --config");
        process::exit(1);
    });
    let out = out.unwrap_or_else(|| {
        eprintln!("Missing --out");
        process::exit(1);
    });

    let cfg = gz_core::Config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        process::exit(1);
    });
    let infer = infer.unwrap_or_else(|| cfg.inference.endpoint.clone());
    let endpoint = Endpoint::parse(&infer).unwrap_or_else(|e| {
        eprintln!("Invalid inference endpoint: {e}");
        process::exit(1);
    });

    let out_dir = PathBuf::from(&out);
    let logs_dir = out_dir.join("logs");
    std::fs::create_dir_all(&logs_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create logs dir: {e}");
        process::exit(1);
    });

    let run_json = out_dir.join("run.json");
    let config_bytes = std::fs::read(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to read config file: {e}");
        process::exit(1);
    });
    let run_id = out_dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(&out)
        .to_string();
    let mut manifest = gz_logging::RunManifestV1 {
        run_manifest_version: gz_logging::RUN_MANIFEST_VERSION,
        run_id,
        created_ts_ms: gz_logging::now_ms(),
        protocol_version: PROTOCOL_VERSION,
        feature_schema_id: FEATURE_SCHEMA_ID,
        game: GAME_NAME.to_string(),
        git_hash: gz_logging::try_git_hash(),
        config_hash: Some(gz_logging::hash_config_bytes(&config_bytes)),
        logs_dir: "logs".to_string(),
        inference_endpoint: infer.clone(),
        seed,
        games_requested: games,
        selfplay_games_completed: 0,
        samples_recorded: 0,
        finished_ts_ms: None,
    };
    // Resuming into an existing run keeps its identity and totals.
    if let Ok(existing) = gz_logging::read_manifest(&run_json) {
        manifest.created_ts_ms = existing.created_ts_ms;
        manifest.run_id = existing.run_id;
        manifest.selfplay_games_completed = existing.selfplay_games_completed;
        manifest.samples_recorded = existing.samples_recorded;
    }
    gz_logging::write_manifest_atomic(&run_json, &manifest).unwrap_or_else(|e| {
        eprintln!("Failed to write run manifest: {e}");
        process::exit(1);
    });

    let timeout = (cfg.inference.timeout_ms > 0)
        .then(|| Duration::from_millis(cfg.inference.timeout_ms));
    let mut host = SocketHost::connect(&endpoint, timeout).unwrap_or_else(|e| {
        eprintln!("Failed to connect to inference host {infer}: {e}");
        process::exit(1);
    });

    let sm = TicTacToe;
    let transformer = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut player = SelfPlayer::new(sm.dupe(), Box::new(transformer), cfg.selfplay.clone(), seed)
        .unwrap_or_else(|e| {
            eprintln!("Invalid self-play config: {e}");
            process::exit(1);
        });

    let v = gz_logging::VersionInfoV1 {
        protocol_version: PROTOCOL_VERSION,
        feature_schema_id: FEATURE_SCHEMA_ID,
        game: GAME_NAME.to_string(),
    };
    let mut moves_log =
        gz_logging::NdjsonWriter::open_append_with_flush(logs_dir.join("moves.ndjson"), log_flush_every)
            .unwrap_or_else(|e| {
                eprintln!("Failed to create move log: {e}");
                process::exit(1);
            });
    let mut games_log =
        gz_logging::NdjsonWriter::open_append_with_flush(logs_dir.join("games.ndjson"), log_flush_every)
            .unwrap_or_else(|e| {
                eprintln!("Failed to create game log: {e}");
                process::exit(1);
            });

    let first_game = manifest.selfplay_games_completed;
    for game_id in first_game..first_game + games {
        let sched0 = player.scheduler_stats().clone();
        let search0 = player.evaluator().stats().clone();
        let tree0 = player.evaluator().store().stats().clone();
        let t0 = Instant::now();
        let game_seed = seed.wrapping_add(game_id);

        let outcome = player.play_game(&mut host, game_seed).unwrap_or_else(|e| {
            eprintln!("Self-play game {game_id} failed: {e}");
            process::exit(1);
        });

        let sched = player.scheduler_stats();
        let search = player.evaluator().stats();
        let tree = player.evaluator().store().stats();
        let event = gz_logging::SelfPlayGameEventV1 {
            event: "selfplay_game".to_string(),
            ts_ms: gz_logging::now_ms(),
            v: v.clone(),
            run_id: manifest.run_id.clone(),
            game_id,
            seed: game_seed,
            game_depth: outcome.game_depth,
            end: end_name(outcome.end).to_string(),
            scores: outcome.scores.clone(),
            samples: outcome.samples.len() as u32,
            run_to_end: outcome.run_to_end,
            batches: sched.batches - sched0.batches,
            predictions: sched.predictions - sched0.predictions,
            max_batch_fill: sched.max_batch_fill as u64,
            collisions: search.collisions - search0.collisions,
            prior_fallbacks: tree.prior_fallbacks - tree0.prior_fallbacks,
            duration_ms: t0.elapsed().as_millis() as u64,
        };

        write_move_events(&mut moves_log, &sm, &v, &manifest.run_id, game_id, &outcome)
            .and_then(|()| games_log.write_event(&event))
            .unwrap_or_else(|e| {
                eprintln!("Failed to write game log: {e}");
                process::exit(1);
            });

        manifest.selfplay_games_completed += 1;
        manifest.samples_recorded += outcome.samples.len() as u64;
        let done = game_id + 1 - first_game;
        if done % 10 == 0 || done == games {
            let _ = gz_logging::write_manifest_atomic(&run_json, &manifest);
        }
        tracing::info!(
            game_id,
            depth = outcome.game_depth,
            end = end_name(outcome.end),
            "self-play game complete"
        );
    }

    let _ = moves_log.flush();
    let _ = games_log.flush();

    manifest.finished_ts_ms = Some(gz_logging::now_ms());
    let _ = gz_logging::write_manifest_atomic(&run_json, &manifest);

    let hs = host.stats();
    println!(
        "Self-play complete. games={games} samples={} batches={} mean_batch_us={:.1} out={out}",
        manifest.samples_recorded,
        hs.batches,
        hs.mean_us()
    );
}

fn cmd_bench_poll(args: &[String]) {
    let mut evals: u32 = 800;
    let mut batch: usize = 8;
    let mut seed: u64 = 0;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!(
                    r#"gz bench-poll

USAGE:
    gz bench-poll [--evals N] [--batch B] [--seed S]

OPTIONS:
    --evals N    Evaluations per move (default: 800)
    --batch B    Batch size (default: 8)
    --seed S     RNG seed (default: 0)
"#
                );
                return;
            }
            "--evals" => {
                evals = flag_value(args, i);
                i += 2;
            }
            "--batch" => {
                batch = flag_value(args, i);
                i += 2;
            }
            "--seed" => {
                seed = flag_value(args, i);
                i += 2;
            }
            other => {
                eprintln!("Unknown option for `gz bench-poll`: {}", other);
                eprintln!("Run `gz bench-poll --help` for usage.");
                process::exit(1);
            }
        }
    }

    let sm = TicTacToe;
    let conf = PuctConfig {
        batch_size: batch,
        think_time: 0.0,
        ..PuctConfig::default()
    };
    let transformer = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut player = Player::new(sm.dupe(), Box::new(transformer), conf, seed).unwrap_or_else(|e| {
        eprintln!("Invalid search config: {e}");
        process::exit(1);
    });
    let mut host = UniformHost::new(player.batch_shape().clone(), 0.5);

    let t0 = Instant::now();
    let mut state = sm.initial_state();
    let mut moves = 0u32;
    let mut max_nodes = 0usize;
    while !sm.is_terminal(&state) {
        let step = player
            .begin_move(state.clone(), evals, None)
            .and_then(|()| drive(&mut player, &mut host).map(|_| ()));
        if let Err(e) = step {
            eprintln!("Search failed at move {moves}: {e}");
            process::exit(1);
        }
        let mut joint = JointMove::new(sm.role_count());
        for role in 0..sm.role_count() {
            let Some(chosen) = player.get_move(role) else {
                eprintln!("Search chose no move at move {moves}");
                process::exit(1);
            };
            joint.set(role, chosen.move_index);
            max_nodes = max_nodes.max(chosen.node_count);
        }
        state = sm.next_state(&state, &joint);
        let step = player
            .apply_move(joint)
            .and_then(|()| drive(&mut player, &mut host).map(|_| ()));
        if let Err(e) = step {
            eprintln!("Applying move {moves} failed: {e}");
            process::exit(1);
        }
        moves += 1;
    }
    let elapsed = t0.elapsed();

    let s = player.scheduler_stats();
    let ss = player.evaluator().stats();
    let fill = if s.batches == 0 {
        0.0
    } else {
        s.predictions as f64 / s.batches as f64
    };
    println!("bench-poll: game={GAME_NAME} evals={evals} batch={batch}");
    println!("  moves={moves} elapsed_ms={}", elapsed.as_millis());
    println!(
        "  polls={} batches={} predictions={} mean_fill={fill:.2} max_fill={}",
        s.polls, s.batches, s.predictions, s.max_batch_fill
    );
    println!(
        "  playouts={} collisions={} max_inflight={} max_nodes={max_nodes}",
        ss.playouts, ss.collisions, ss.max_inflight
    );
}

fn main() {
    init_tracing();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        process::exit(0);
    }

    match args[1].as_str() {
        "-h" | "--help" | "help" => {
            print_help();
        }
        "-V" | "--version" => {
            print_version();
        }
        "selfplay" => {
            cmd_selfplay(&args[2..]);
        }
        "bench-poll" => {
            cmd_bench_poll(&args[2..]);
        }
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            eprintln!("Run `gz --help` for usage.");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_names_are_distinct() {
        let names = [
            end_name(GameEnd::Terminal),
            end_name(GameEnd::Resigned { role: 0 }),
            end_name(GameEnd::EarlyLoss { role: 1 }),
            end_name(GameEnd::RepetitionDraw),
            end_name(GameEnd::Aborted),
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn lead_role_is_the_mover() {
        let sm = TicTacToe;
        let s = sm.initial_state();
        assert_eq!(lead_role(&sm, &s), 0);
        let mut joint = JointMove::new(2);
        joint.set(0, 4);
        joint.set(1, gz_core::games::tictactoe::NOOP);
        assert_eq!(lead_role(&sm, &sm.next_state(&s, &joint)), 1);
    }
}
