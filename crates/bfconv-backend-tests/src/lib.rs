//! Conformance suite every `bfconv` kernel collaborator runs through [`define_conv_tests!`].
//!
//! Scenarios create primitives through the public factory, feed them seeded random bf16 data
//! in the blocked layouts and compare against a naive f32 convolution over plain tensors.

pub mod api_invariants;
pub mod common;
pub mod smoke;

#[macro_export]
macro_rules! define_conv_tests {
    ($module:ident, $fwd:ty, $bwd:ty) => {
        #[cfg(test)]
        mod $module {
            use $crate::{api_invariants, smoke};

            macro_rules! conv_test {
                ($name:ident, $group:ident :: $scenario:ident) => {
                    #[test]
                    fn $name() {
                        $group::$scenario::<$fwd, $bwd>();
                    }
                };
            }

            conv_test!(smoke_forward_1d_full_blocks, smoke::forward_1d_full_blocks);
            conv_test!(
                smoke_forward_1d_partial_block_zeroes_tail,
                smoke::forward_1d_partial_block_zeroes_tail
            );
            conv_test!(
                smoke_forward_2d_strided_padded_with_bias,
                smoke::forward_2d_strided_padded_with_bias
            );
            conv_test!(smoke_forward_2d_dilated_bf16_bias, smoke::forward_2d_dilated_bf16_bias);
            conv_test!(smoke_forward_3d, smoke::forward_3d);
            conv_test!(smoke_forward_grouped, smoke::forward_grouped);
            conv_test!(smoke_forward_bf16_dst, smoke::forward_bf16_dst);
            conv_test!(smoke_forward_post_ops, smoke::forward_post_ops);
            conv_test!(smoke_backward_data_1d, smoke::backward_data_1d);
            conv_test!(
                smoke_backward_data_2d_strided_padded,
                smoke::backward_data_2d_strided_padded
            );
            conv_test!(smoke_backward_data_3d_dilated, smoke::backward_data_3d_dilated);
            conv_test!(
                smoke_backward_data_grouped_bf16_diff_src,
                smoke::backward_data_grouped_bf16_diff_src
            );
            conv_test!(
                smoke_direction_mismatch_is_unsupported,
                smoke::direction_mismatch_is_unsupported
            );
            conv_test!(
                smoke_backward_data_follows_forward_hint,
                smoke::backward_data_follows_forward_hint
            );

            conv_test!(
                api_creation_requires_avx512_core,
                api_invariants::creation_requires_avx512_core
            );
            conv_test!(
                api_repeated_executions_are_bit_identical,
                api_invariants::repeated_executions_are_bit_identical
            );
            conv_test!(
                api_concurrent_executions_agree,
                api_invariants::concurrent_executions_agree
            );
            conv_test!(
                api_reduction_heavy_problem_matches_reference,
                api_invariants::reduction_heavy_problem_matches_reference
            );
            conv_test!(api_user_scratchpad_mode, api_invariants::user_scratchpad_mode);
            conv_test!(
                api_reused_scratchpad_keeps_no_state,
                api_invariants::reused_scratchpad_keeps_no_state
            );
            conv_test!(
                api_foreign_scratchpad_is_rejected,
                api_invariants::foreign_scratchpad_is_rejected
            );
            conv_test!(
                api_malformed_arguments_are_invalid,
                api_invariants::malformed_arguments_are_invalid
            );
        }
    };
}
