use std::net::TcpListener;
use std::thread;

use gz_core::games::TicTacToe;
use gz_core::{PuctConfig, SelfPlayConfig, StateMachine};
use gz_features::{BasesTransformer, PolicyHeads};
use gz_infer::codec::{decode_request, encode_response};
use gz_infer::frame::{read_frame, write_frame};
use gz_infer::protocol::BatchResponseV1;
use gz_infer::{Endpoint, SocketHost, UniformHost};
use gz_runtime::{GameEnd, SelfPlayer};

fn search_conf() -> PuctConfig {
    PuctConfig {
        think_time: 0.0,
        batch_size: 8,
        ..PuctConfig::default()
    }
}

fn selfplay_conf() -> SelfPlayConfig {
    SelfPlayConfig {
        puct_config: search_conf(),
        run_to_end_puct_config: PuctConfig {
            dirichlet_noise_pct: 0.0,
            ..search_conf()
        },
        evals_per_move: 24,
        resign0_pct: 0.0,
        resign1_pct: 0.0,
        ..SelfPlayConfig::default()
    }
}

fn self_player(conf: SelfPlayConfig) -> SelfPlayer {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    SelfPlayer::new(sm.dupe(), Box::new(t), conf, 9).unwrap()
}

#[test]
fn full_game_records_a_sample_per_ply() {
    let mut sp = self_player(selfplay_conf());
    let mut host = UniformHost::new(sp.batch_shape().clone(), 0.5);
    let out = sp.play_game(&mut host, 1).unwrap();

    assert_eq!(out.end, GameEnd::Terminal);
    assert!((5..=9).contains(&out.game_depth));
    assert_eq!(out.moves.len() as u32, out.game_depth);
    assert_eq!(out.samples.len() as u32, out.game_depth);
    assert!(!out.run_to_end);
    for (ply, s) in out.samples.iter().enumerate() {
        assert_eq!(s.game_depth, ply as u32);
        assert_eq!(s.lead_role, ply % 2);
        assert_eq!(s.scores, out.scores);
        let sum: f32 = s.policy.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }
}

#[test]
fn abort_drops_samples() {
    let conf = SelfPlayConfig {
        abort_max_length: 3,
        ..selfplay_conf()
    };
    let mut sp = self_player(conf);
    let mut host = UniformHost::new(sp.batch_shape().clone(), 0.5);
    let out = sp.play_game(&mut host, 2).unwrap();
    assert_eq!(out.end, GameEnd::Aborted);
    assert_eq!(out.game_depth, 3);
    assert!(out.samples.is_empty());
}

#[test]
fn repeated_state_ends_in_a_draw() {
    let conf = SelfPlayConfig {
        number_repeat_states_draw: 1,
        repeat_states_score: 0.25,
        ..selfplay_conf()
    };
    let mut sp = self_player(conf);
    let mut host = UniformHost::new(sp.batch_shape().clone(), 0.5);
    let out = sp.play_game(&mut host, 3).unwrap();
    assert_eq!(out.end, GameEnd::RepetitionDraw);
    assert_eq!(out.game_depth, 0);
    assert_eq!(out.scores, vec![0.25, 0.25]);
}

#[test]
fn hopeless_position_resigns() {
    let conf = SelfPlayConfig {
        resign0_pct: 1.0,
        resign0_score_probability: 1.1,
        run_to_end_minimum_game_depth: 0,
        run_to_end_pct: 0.0,
        ..selfplay_conf()
    };
    let mut sp = self_player(conf);
    let mut host = UniformHost::new(sp.batch_shape().clone(), 0.5);
    let out = sp.play_game(&mut host, 4).unwrap();
    assert_eq!(out.end, GameEnd::Resigned { role: 0 });
    assert_eq!(out.game_depth, 0);
    assert_eq!(out.scores, vec![0.0, 1.0]);
    assert_eq!(out.samples.len(), 1);
    assert_eq!(out.samples[0].scores, vec![0.0, 1.0]);
}

#[test]
fn overridden_resign_runs_to_the_end() {
    let conf = SelfPlayConfig {
        resign0_pct: 1.0,
        resign0_score_probability: 1.1,
        run_to_end_minimum_game_depth: 0,
        run_to_end_pct: 1.0,
        run_to_end_early_score: 0.0,
        ..selfplay_conf()
    };
    let mut sp = self_player(conf);
    let mut host = UniformHost::new(sp.batch_shape().clone(), 0.5);
    let out = sp.play_game(&mut host, 5).unwrap();
    assert!(out.run_to_end);
    assert_eq!(out.end, GameEnd::Terminal);
    // only the ply that triggered the switch is sampled
    assert_eq!(out.samples.len(), 1);
}

#[test]
fn games_can_be_played_back_to_back() {
    let mut sp = self_player(selfplay_conf());
    let mut host = UniformHost::new(sp.batch_shape().clone(), 0.5);
    for seed in 0..3 {
        let out = sp.play_game(&mut host, seed).unwrap();
        assert_eq!(out.end, GameEnd::Terminal);
    }
}

fn uniform_answer(count: usize, shape: &gz_infer::BatchShape) -> BatchResponseV1 {
    BatchResponseV1 {
        batch_id: 0,
        count: count as u32,
        role_count: shape.role_count as u32,
        policy_lens: shape.policy_lens.iter().map(|&l| l as u32).collect(),
        policies: shape
            .policy_lens
            .iter()
            .map(|&l| vec![1.0 / l as f32; count * l])
            .collect(),
        final_values: vec![0.5; count * shape.role_count],
    }
}

#[test]
fn game_over_tcp_host() {
    let mut sp = self_player(selfplay_conf());
    let shape = sp.batch_shape().clone();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_shape = shape.clone();
    let server = thread::spawn(move || {
        let (mut sock, _peer) = listener.accept().unwrap();
        let mut served = 0u64;
        while let Ok(payload) = read_frame(&mut sock) {
            let req = decode_request(&payload).unwrap();
            assert_eq!(req.channel_len as usize, server_shape.channel_len);
            let mut resp = uniform_answer(req.count as usize, &server_shape);
            resp.batch_id = req.batch_id;
            if write_frame(&mut sock, &encode_response(&resp)).is_err() {
                break;
            }
            served += 1;
        }
        served
    });

    let endpoint = Endpoint::parse(&format!("tcp://{addr}")).unwrap();
    let mut host = SocketHost::connect(&endpoint, None).unwrap();
    let out = sp.play_game(&mut host, 6).unwrap();
    assert_eq!(out.end, GameEnd::Terminal);
    let batches = host.stats().batches;
    drop(host);
    assert_eq!(server.join().unwrap(), batches);
}
