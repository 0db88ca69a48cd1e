mod operation;
mod pool_map;
mod system_map;
mod task;

pub use operation::{NextAction, PoolScanOperation, ScanState, SystemScanOperation};
pub use pool_map::{PoolScanOperationMap, PoolScannerConfig};
pub use system_map::{SystemScanOperationMap, SystemScannerConfig};
pub use task::{CancelFlag, PoolScanHandler, ScanTaskHandle, SystemScanHandler};
