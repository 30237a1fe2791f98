mod direct;

pub use direct::{direct_pair, DirectEndpoint};
