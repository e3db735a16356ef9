pub mod config;
pub mod drm;
pub mod error;
pub mod format;
pub mod utils;
pub mod winsys;

pub use config::WinsysConfig;
pub use error::{WinsysError, WinsysResult};
pub use winsys::WinSys;
pub use winsys::bo::{BufferObject, acquire, release};
pub use winsys::exec::{ExecFlags, Ring};
pub use winsys::handle::{ExternalHandle, HandleType, ImportedBo, WinsysHandle};
pub use winsys::probe::DeviceInfo;
pub use winsys::reloc::{Domains, RelocFlags};
pub use winsys::tiling::{Swizzle, Tiling};
pub use winsys::wait::WaitStatus;
