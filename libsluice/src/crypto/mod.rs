pub mod commitment;
pub mod keys;
pub mod merkle;

pub use commitment::{
    hash_channel_commitment, hash_withdraw_commitment, verify_update_signatures, WithdrawCommitment,
};
pub use keys::{ChannelSigner, KeyError, Signature};
pub use merkle::merkle_root;
