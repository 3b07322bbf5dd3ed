pub mod layout;
pub mod slab;
pub mod wavl;

pub use slab::MapError;
pub use slab::Record;
pub use slab::Slab;
pub use slab::SENTINEL;

pub use layout::Plan;
pub use wavl::Branch;
pub use wavl::Handle;
pub use wavl::Placement;
pub use wavl::WavlMap;
