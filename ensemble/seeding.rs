//! Sub-seed derivation. A run carries exactly one seed; every random stream in the crate
//! (member configurations, training sub-samples, input resampling) is keyed off it by a
//! `(stream, index)` pair, so adding members or objects never shifts the draws of others.

use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedStream {
    Configuration,
    Subsample,
    InputResampling,
}

impl SeedStream {
    fn tag(self) -> u64 {
        match self {
            Self::Configuration => 0x636f_6e66,
            Self::Subsample => 0x7375_6273,
            Self::InputResampling => 0x7265_7361,
        }
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

pub fn derive_seed(seed: u64, stream: SeedStream, index: u64) -> u64 {
    splitmix64(splitmix64(seed ^ stream.tag()) ^ index)
}

pub fn stream_rng(seed: u64, stream: SeedStream, index: u64) -> StdRng {
    StdRng::seed_from_u64(derive_seed(seed, stream, index))
}
