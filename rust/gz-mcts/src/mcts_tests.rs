use std::cell::Cell;

use gz_core::games::tictactoe::NOOP;
use gz_core::games::{Branching, TicTacToe};
use gz_core::{JointMove, PuctConfig, StateMachine};
use gz_features::{BasesTransformer, PolicyHeads, Transformer};

use crate::{
    choose_top_visits, drive_inline, Continuation, EvalStatus, FnInference, InlineBackend, Job, Launch, NodeDebug, Prediction, Progress,
    PuctEvaluator, SearchError, SearchTask, TreeError, UniformInference,
};

fn conf(batch_size: usize) -> PuctConfig {
    PuctConfig {
        think_time: 0.0,
        dirichlet_noise_pct: 0.0,
        batch_size,
        ..PuctConfig::default()
    }
}

fn run(
    jobs: Vec<Job>,
    ev: &mut PuctEvaluator,
    backend: &mut InlineBackend<'_, impl crate::Inference>,
) -> Result<SearchTask, SearchError> {
    let mut task = SearchTask::new(jobs);
    drive_inline(&mut task, ev, backend)?;
    Ok(task)
}

fn count_nodes(n: &NodeDebug) -> usize {
    1 + n
        .edges
        .iter()
        .filter_map(|e| e.child.as_ref())
        .map(count_nodes)
        .sum::<usize>()
}

#[test]
fn three_moves_of_fifty_evaluations_in_batches_of_eight() {
    let sm = Branching::new(3, 10);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 1);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 1.0), 8);

    run(vec![Job::EstablishRoot(Some(sm.initial_state()))], &mut ev, &mut backend).unwrap();
    for ply in 0..3u32 {
        let before = ev.node_count();
        let mut task = run(
            vec![Job::NextMove {
                evaluations: 50,
                deadline: None,
            }],
            &mut ev,
            &mut backend,
        )
        .unwrap();
        let choice = task.take_choice().expect("a move is chosen");
        let root = ev.root_node().unwrap();
        assert_eq!(root.game_depth, ply);
        assert!(root.children.iter().map(|e| e.visits).sum::<u32>() >= 50);

        // the chosen move is the most visited root child
        let most = root.children.iter().map(|e| e.visits).max().unwrap();
        assert_eq!(root.children[choice.edge].visits, most);
        assert_eq!(choose_top_visits(&root.children, root.lead_role), Some(choice.edge));

        // one node per evaluated state, all reachable from the root
        if ply == 0 {
            assert!(ev.node_count() <= 51, "{} nodes", ev.node_count());
        }
        assert!(ev.node_count() <= before + 50);
        assert_eq!(count_nodes(&ev.debug_root(u32::MAX).unwrap()), ev.node_count());
        assert_eq!(ev.inflight(), 0);
        assert!(root.children.iter().all(|e| e.inflight == 0));

        run(vec![Job::ApplyMove(choice.joint)], &mut ev, &mut backend).unwrap();
    }
    assert_eq!(ev.game_depth(), 3);
    assert!(ev.stats().max_inflight <= 8);
    assert!(backend.batches() > 0);
}

#[test]
fn first_search_backs_up_exactly_the_budget() {
    let sm = Branching::new(3, 10);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 2);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    run(
        vec![
            Job::EstablishRoot(None),
            Job::NextMove {
                evaluations: 50,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let root = ev.root_node().unwrap();
    assert_eq!(root.visits, 51);
    assert_eq!(root.children.iter().map(|e| e.visits).sum::<u32>(), 50);
}

#[test]
fn apply_move_prunes_to_the_chosen_subtree() {
    let sm = Branching::new(3, 4);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(4), 3);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 4);

    let mut task = run(
        vec![
            Job::EstablishRoot(Some(sm.initial_state())),
            Job::NextMove {
                evaluations: 40,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let choice = task.take_choice().unwrap();
    let old_root = ev.root().unwrap();
    let snapshot = ev.debug_root(u32::MAX).unwrap();
    assert_eq!(count_nodes(&snapshot), ev.node_count());
    let kept = snapshot.edges[choice.edge]
        .child
        .as_ref()
        .map_or(1, count_nodes);

    run(vec![Job::ApplyMove(choice.joint)], &mut ev, &mut backend).unwrap();
    assert_eq!(ev.node_count(), kept);
    assert_eq!(ev.node(old_root).unwrap_err(), TreeError::Stale(old_root));
    assert!(ev.store().stats().freed > 0);
}

#[test]
fn transpositions_do_not_grow_across_games() {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut c = conf(8);
    c.lookup_transpositions = true;
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, c, 4);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    for _game in 0..3 {
        ev.reset(0);
        run(vec![Job::EstablishRoot(None)], &mut ev, &mut backend).unwrap();
        let mut state = sm.initial_state();
        while !sm.is_terminal(&state) {
            let mut task = run(
                vec![Job::NextMove {
                    evaluations: 40,
                    deadline: None,
                }],
                &mut ev,
                &mut backend,
            )
            .unwrap();
            let choice = task.take_choice().unwrap();
            state = sm.next_state(&state, &choice.joint);
            run(vec![Job::ApplyMove(choice.joint)], &mut ev, &mut backend).unwrap();

            assert_eq!(ev.root_node().unwrap().state, state);
            assert_eq!(ev.store().transposition_count(), ev.node_count());
            assert!(ev.node_count() < 2_000);
        }
    }
    assert!(ev.store().stats().transposition_hits > 0);
}

#[test]
fn converged_search_stops_before_the_budget() {
    let sm = Branching::new(3, 10);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut c = conf(8);
    c.converged_visits = 3;
    c.top_visits_best_guess_converge_ratio = 2.0;
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, c, 5);
    let inference = FnInference(|_: &[f32]| Prediction {
        policies: vec![vec![0.98, 0.01, 0.01]],
        values: vec![0.5],
    });
    let mut backend = InlineBackend::new(&t, inference, 8);

    run(
        vec![
            Job::EstablishRoot(None),
            Job::NextMove {
                evaluations: 10_000,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let visits: u32 = ev.root_node().unwrap().children.iter().map(|e| e.visits).sum();
    assert!(visits < 100, "visits={visits}");
}

#[test]
fn zero_evaluations_without_deadline_chooses_from_priors_only() {
    let sm = Branching::new(3, 10);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 6);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    let mut task = run(
        vec![
            Job::EstablishRoot(None),
            Job::NextMove {
                evaluations: 0,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    assert_eq!(ev.root_node().unwrap().visits, 1);
    assert_eq!(task.take_choice().unwrap().edge, 0);
}

#[test]
fn second_identical_apply_is_an_error() {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 7);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    let x_center = JointMove::from_moves(vec![4, NOOP]);
    run(
        vec![Job::EstablishRoot(None), Job::ApplyMove(x_center.clone())],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let err = run(vec![Job::ApplyMove(x_center)], &mut ev, &mut backend).unwrap_err();
    assert!(matches!(
        err,
        SearchError::Tree(TreeError::IllegalMove { role: 1, lead_move: NOOP, .. })
    ));
}

#[test]
fn search_before_root_is_an_error() {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 8);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    let err = run(
        vec![Job::NextMove {
            evaluations: 10,
            deadline: None,
        }],
        &mut ev,
        &mut backend,
    )
    .unwrap_err();
    assert!(matches!(err, SearchError::NoRoot));
    let err = ev.apply_move(&JointMove::from_moves(vec![0, NOOP])).unwrap_err();
    assert!(matches!(err, SearchError::NoRoot));
}

#[test]
fn root_holds_the_supplied_state() {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 9);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    let s0 = sm.initial_state();
    let s1 = sm.next_state(&s0, &JointMove::from_moves(vec![0, NOOP]));
    let s2 = sm.next_state(&s1, &JointMove::from_moves(vec![NOOP, 4]));
    ev.reset(2);
    run(vec![Job::EstablishRoot(Some(s2.clone()))], &mut ev, &mut backend).unwrap();

    let root = ev.root_node().unwrap();
    assert_eq!(root.state, s2);
    assert_eq!(root.game_depth, 2);
    assert_eq!(root.lead_role, 0);
    assert_eq!(root.num_children(), 7);
    assert!(root.is_expanded());
    assert!(ev.node_count() >= 1);
}

#[test]
fn batches_never_exceed_the_backend_size() {
    let sm = Branching::new(5, 6);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(4), 10);
    let sizes = Cell::new(0usize);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 4);

    run(vec![Job::EstablishRoot(None)], &mut ev, &mut backend).unwrap();
    let mut task = SearchTask::new([Job::NextMove {
        evaluations: 100,
        deadline: None,
    }]);
    loop {
        match crate::Continuation::resume(&mut task, &mut ev, &mut backend).unwrap() {
            crate::Progress::Done => break,
            crate::Progress::Blocked => {
                assert!(backend.queued() <= 4);
                sizes.set(sizes.get().max(backend.queued()));
                assert!(backend.flush() > 0);
            }
        }
    }
    assert!(sizes.get() >= 1);
    assert!(ev.stats().max_inflight <= 4);
}

#[test]
fn solved_win_ends_search_early() {
    let sm = Branching::new(2, 1);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 11);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    let mut task = run(
        vec![
            Job::EstablishRoot(None),
            Job::NextMove {
                evaluations: 500,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let choice = task.take_choice().unwrap();
    assert_eq!(choice.lead_move, 0);
    let root = ev.root_node().unwrap();
    assert!(root.finalised);
    assert_eq!(root.final_scores, vec![1.0]);
    assert!(root.visits < 10);
}

#[test]
fn legal_count_draw_stops_evaluation_at_depth() {
    let sm = Branching::new(3, 10);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut c = conf(8);
    c.use_legals_count_draw = 2;
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, c, 12);
    let calls = Cell::new(0u32);
    let inference = FnInference(|_: &[f32]| {
        calls.set(calls.get() + 1);
        Prediction {
            policies: vec![vec![1.0 / 3.0; 3]],
            values: vec![0.5],
        }
    });
    let mut backend = InlineBackend::new(&t, inference, 8);

    run(
        vec![
            Job::EstablishRoot(None),
            Job::NextMove {
                evaluations: 60,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    // root plus at most the three depth-1 nodes
    assert!(calls.get() <= 4);
    let snapshot = ev.debug_root(3).unwrap();
    for e in &snapshot.edges {
        for grand in e.child.iter().flat_map(|c| c.edges.iter()) {
            if let Some(g) = &grand.child {
                assert!(g.finalised);
                assert_eq!(g.scores, vec![0.5]);
            }
        }
    }
}

#[test]
fn fresh_task_drops_a_root_request_from_a_dropped_backend() {
    let sm = Branching::new(3, 6);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(4), 17);
    let mut old = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 4);

    let mut task = SearchTask::new(vec![
        Job::EstablishRoot(Some(sm.initial_state())),
        Job::NextMove {
            evaluations: 20,
            deadline: None,
        },
    ]);
    assert_eq!(task.resume(&mut ev, &mut old).unwrap(), Progress::Blocked);
    assert_eq!(old.queued(), 1);
    drop(task);
    drop(old);

    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 4);
    let mut task = run(
        vec![Job::NextMove {
            evaluations: 20,
            deadline: None,
        }],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    assert!(task.take_choice().is_some());
    assert_eq!(ev.root_node().unwrap().status, EvalStatus::Expanded);
    assert_eq!(ev.inflight(), 0);
}

#[test]
fn abandon_removes_virtual_visits() {
    let sm = Branching::new(4, 5);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 13);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);
    run(vec![Job::EstablishRoot(None)], &mut ev, &mut backend).unwrap();

    assert_eq!(ev.launch(&mut backend, Some(0)).unwrap(), Launch::Pending);
    assert_eq!(ev.launch(&mut backend, Some(1)).unwrap(), Launch::Pending);
    assert_eq!(ev.launch(&mut backend, Some(1)).unwrap(), Launch::Collision);
    assert_eq!(ev.inflight(), 2);
    assert_eq!(ev.root_node().unwrap().inflight, 2);

    ev.abandon();
    assert_eq!(ev.inflight(), 0);
    let root = ev.root_node().unwrap();
    assert_eq!(root.inflight, 0);
    for e in &root.children[..2] {
        assert_eq!(e.inflight, 0);
        let child = ev.node(e.child.unwrap()).unwrap();
        assert_eq!(child.status, EvalStatus::Unevaluated);
    }
    assert_eq!(ev.stats().collisions, 1);
}

#[test]
fn balance_evens_out_first_moves() {
    let sm = Branching::new(4, 5);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 14);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    run(
        vec![Job::EstablishRoot(None), Job::Balance { max_count: 3 }],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let root = ev.root_node().unwrap();
    for e in &root.children[..3] {
        assert!(e.child.is_some());
        assert_eq!(e.visits, 1);
    }
    assert_eq!(root.children[3].visits, 0);
    assert!(ev.balance_state(3).unwrap().1);
}

#[test]
fn root_noise_keeps_a_distribution() {
    let sm = Branching::new(6, 4);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut c = conf(8);
    c.dirichlet_noise_pct = 0.25;
    c.noise_policy_squash_prob = 1.0;
    c.noise_policy_squash_pct = 0.5;
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, c, 15);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    run(
        vec![
            Job::EstablishRoot(None),
            Job::NextMove {
                evaluations: 8,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let root = ev.root_node().unwrap();
    let sum: f32 = root.children.iter().map(|e| e.noisy_prior).sum();
    assert!((sum - 1.0).abs() < 1e-4, "sum={sum}");
    assert!(root.children.iter().any(|e| (e.noisy_prior - e.prior).abs() > 1e-6));
    assert_eq!(ev.stats().noise_applied, 1);
}

#[test]
fn malformed_prediction_is_an_error() {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 16);
    let inference = FnInference(|_: &[f32]| Prediction {
        policies: vec![vec![0.5; 3]],
        values: vec![0.5, 0.5],
    });
    let mut backend = InlineBackend::new(&t, inference, 8);

    let err = run(vec![Job::EstablishRoot(None)], &mut ev, &mut backend).unwrap_err();
    assert!(matches!(
        err,
        SearchError::Tree(TreeError::MalformedPrediction { .. })
    ));
}

#[test]
fn per_role_heads_use_the_lead_role_row() {
    let sm = TicTacToe;
    let t = BasesTransformer::for_game(&sm, PolicyHeads::PerRole);
    assert_eq!(t.policy_count(), 2);
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, conf(8), 17);
    // head 0 prefers cell 0, head 1 prefers cell 8
    let inference = FnInference(|_: &[f32]| {
        let mut x = vec![0.01; 10];
        x[0] = 0.9;
        let mut o = vec![0.01; 10];
        o[8] = 0.9;
        Prediction {
            policies: vec![x, o],
            values: vec![0.5, 0.5],
        }
    });
    let mut backend = InlineBackend::new(&t, inference, 8);

    run(
        vec![
            Job::EstablishRoot(None),
            Job::ApplyMove(JointMove::from_moves(vec![4, NOOP])),
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let root = ev.root_node().unwrap();
    assert_eq!(root.lead_role, 1);
    let best = root
        .children
        .iter()
        .max_by(|a, b| a.prior.total_cmp(&b.prior))
        .unwrap();
    assert_eq!(best.lead_move, 8);
}

#[test]
fn tree_dump_renders_root() {
    let sm = Branching::new(2, 3);
    let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
    let mut c = conf(8);
    c.verbose = true;
    let mut ev = PuctEvaluator::new(sm.dupe(), &t, c, 18);
    let mut backend = InlineBackend::new(&t, UniformInference::for_transformer(&t, 0.5), 8);

    run(
        vec![
            Job::EstablishRoot(None),
            Job::NextMove {
                evaluations: 6,
                deadline: None,
            },
        ],
        &mut ev,
        &mut backend,
    )
    .unwrap();
    let dump = ev.debug_root(1).unwrap().to_string();
    assert!(dump.starts_with("depth=0"));
    assert!(dump.lines().count() > 2);
    assert_eq!(ev.debug_root_edges(1, 0).unwrap().len(), 1);
}
