use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gz_core::games::TicTacToe;
use gz_core::{PuctConfig, StateMachine};
use gz_features::{BasesTransformer, PolicyHeads};
use gz_infer::UniformHost;
use gz_runtime::{drive, Player};

/// Poll overhead of the scheduler: one search through the Player facade.
fn bench_player_poll(c: &mut Criterion) {
    let sm = TicTacToe;
    let conf = PuctConfig {
        think_time: 0.0,
        batch_size: 8,
        ..PuctConfig::default()
    };

    c.bench_function("gz_runtime_player_move_200", |b| {
        b.iter(|| {
            let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
            let mut player = Player::new(sm.dupe(), Box::new(t), conf.clone(), 0).unwrap();
            let mut host = UniformHost::new(player.batch_shape().clone(), 0.5);
            player.begin_move(sm.initial_state(), 200, None).unwrap();
            let stats = drive(&mut player, &mut host).unwrap();
            black_box(stats.polls)
        })
    });
}

criterion_group!(benches, bench_player_poll);
criterion_main!(benches);
