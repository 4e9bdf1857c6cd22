//! gz-features: network-input encoding for game states.

pub mod encode;
pub mod schema;

pub use encode::{encode_batch, BasesTransformer, Transformer};
pub use schema::{ChannelLayout, PolicyHeads, CHANNEL_ALIGN, FEATURE_SCHEMA_ID};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use gz_core::games::tictactoe::NOOP;
    use gz_core::games::{Branching, TicTacToe};
    use gz_core::{JointMove, StateMachine};

    #[test]
    fn version_is_nonempty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn layout_pads_to_alignment() {
        let l = ChannelLayout::new(20);
        assert_eq!(l.channel_len, 24);
        assert_eq!(l.padding(), 4);
        assert_eq!(ChannelLayout::new(0).channel_len, CHANNEL_ALIGN);
        assert_eq!(ChannelLayout::new(16).channel_len, 16);
    }

    #[test]
    fn bases_are_encoded_as_ones() {
        let sm = TicTacToe;
        let t = BasesTransformer::for_game(&sm, PolicyHeads::PerRole);
        let s = sm.next_state(&sm.initial_state(), &JointMove::from_moves(vec![4, NOOP]));
        let mut out = vec![7.0; t.channel_len()];
        t.encode_into(&s, &mut out);
        let ones: Vec<usize> = (0..out.len()).filter(|&i| out[i] == 1.0).collect();
        assert_eq!(ones, s.ones().collect::<Vec<_>>());
        assert_eq!(out.iter().filter(|&&v| v == 0.0).count(), out.len() - ones.len());
    }

    #[test]
    fn head_shapes_follow_mode() {
        let sm = TicTacToe;
        let per_role = BasesTransformer::for_game(&sm, PolicyHeads::PerRole);
        assert_eq!(per_role.policy_count(), 2);
        assert_eq!(per_role.policy_len(1), sm.move_count(1));

        let shared = BasesTransformer::for_game(&Branching::new(4, 3), PolicyHeads::Shared);
        assert_eq!(shared.policy_count(), 1);
        assert_eq!(shared.policy_len(0), 4);
        assert_eq!(shared.role_count(), 1);
    }

    #[test]
    fn batch_encoding_concatenates_states() {
        let sm = Branching::new(2, 3);
        let t = BasesTransformer::for_game(&sm, PolicyHeads::Shared);
        let s0 = sm.initial_state();
        let s1 = sm.next_state(&s0, &JointMove::from_moves(vec![1]));
        let buf = encode_batch(&t, [&s0, &s1]);
        assert_eq!(buf.len(), 2 * t.channel_len());
        let mut single = vec![0.0; t.channel_len()];
        t.encode_into(&s1, &mut single);
        assert_eq!(&buf[t.channel_len()..], single.as_slice());
    }
}
