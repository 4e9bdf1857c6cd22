//! Move choice at the root: greedy by visits or sampled with a temperature.

use gz_core::PuctConfig;
use rand::Rng;

use crate::node::PuctEdge;

/// Most visited edge; ties go to the higher mean for `role`, then to the
/// lower index. `None` only for an empty edge list.
pub fn choose_top_visits(edges: &[PuctEdge], role: usize) -> Option<usize> {
    let mut best: Option<(usize, u32, f32)> = None;
    for (i, e) in edges.iter().enumerate() {
        let mean = e.mean(role);
        let better = match best {
            None => true,
            Some((_, v, m)) => e.visits > v || (e.visits == v && mean > m),
        };
        if better {
            best = Some((i, e.visits, mean));
        }
    }
    best.map(|(i, _, _)| i)
}

/// Temperature for a move at `depth`, or `None` when the move should be
/// chosen greedily.
pub fn temperature_for_depth(conf: &PuctConfig, depth: u32) -> Option<f32> {
    if conf.depth_temperature_stop > 0 && depth >= conf.depth_temperature_stop {
        return None;
    }
    let t = if depth < conf.depth_temperature_start {
        conf.temperature
    } else {
        let steps = (depth - conf.depth_temperature_start + 1) as f32;
        let divisor = (1.0 + conf.depth_temperature_increment * steps).min(conf.depth_temperature_max);
        if !(divisor > 0.0) {
            return None;
        }
        conf.temperature / divisor
    };
    (t.is_finite() && t > 0.0).then_some(t)
}

/// Sample a visited edge with probability proportional to
/// `visits^(1/temperature)`. The uniform draw is multiplied by
/// `random_scale`, so values below 1 bias toward the most visited edges.
/// Edges are ordered as [`choose_top_visits`] ranks them for `role`. Below
/// the temperature at which one visit more than the top count no longer
/// carries any weight, the choice is the greedy one.
pub fn choose_temperature<R: Rng>(
    edges: &[PuctEdge],
    role: usize,
    temperature: f32,
    random_scale: f32,
    rng: &mut R,
) -> Option<usize> {
    let mut visited: Vec<(usize, u32, f32)> = edges
        .iter()
        .enumerate()
        .filter(|(_, e)| e.visits > 0)
        .map(|(i, e)| (i, e.visits, e.mean(role)))
        .collect();
    if visited.is_empty() {
        return None;
    }
    // stable: full ties keep index order
    visited.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.total_cmp(&a.2)));

    let top = visited[0].1 as f32;
    let resolution = ((top.ln() - (top + 1.0).ln()) / temperature).exp();
    if !(temperature > 0.0) || resolution == 0.0 {
        return Some(visited[0].0);
    }

    let max_log = top.ln();
    let weights: Vec<f32> = visited
        .iter()
        .map(|&(_, v, _)| (((v as f32).ln() - max_log) / temperature).exp())
        .collect();
    let total: f32 = weights.iter().sum();

    let target = rng.gen::<f32>() * random_scale.clamp(0.0, 1.0) * total;
    let mut acc = 0.0;
    for (&(i, _, _), w) in visited.iter().zip(&weights) {
        acc += w;
        if acc >= target {
            return Some(i);
        }
    }
    visited.last().map(|&(i, _, _)| i)
}

/// Visit distribution over `move_count` moves of `lead_role`, sharpened by
/// `temperature`. A non-positive temperature gives a one-hot target on the
/// most visited move.
pub fn visit_policy(
    edges: &[PuctEdge],
    lead_role: usize,
    move_count: usize,
    temperature: f32,
) -> Vec<f32> {
    let mut policy = vec![0.0; move_count];
    if !(temperature > 0.0) {
        if let Some(i) = choose_top_visits(edges, lead_role) {
            if let Some(p) = policy.get_mut(edges[i].lead_move as usize) {
                *p = 1.0;
            }
        }
        return policy;
    }
    let mut total = 0.0;
    for e in edges.iter().filter(|e| e.visits > 0) {
        let w = (e.visits as f32).powf(1.0 / temperature);
        if let Some(p) = policy.get_mut(e.lead_move as usize) {
            *p = w;
            total += w;
        }
    }
    if total > 0.0 {
        for p in &mut policy {
            *p /= total;
        }
    }
    policy
}
