pub mod callable;
pub mod composer;
pub mod config;
pub mod counters;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod fault;
pub mod input;
pub mod relay;
pub mod sink;
pub mod status;
pub mod supervisor;
pub mod tracer;
pub mod value;

pub use callable::{ExtensionError, NativeExtension, TestCallable};
pub use composer::{ComposeError, Composer, SanitizerFlavor, Toolchain};
pub use config::BridgeConfig;
pub use dispatcher::{Dispatch, Dispatcher};
pub use driver::{ArgVector, DriverError, libfuzzer_is_loaded, run, try_run};
pub use input::FuzzInput;
pub use relay::{SinkHandle, Traced, trace_cmp, trace_div};
pub use sink::{CoverageEvent, CoverageSink, EngineSink, Op, RecordingSink, Width};
pub use status::ExitStatus;
pub use supervisor::{ChildCommand, ChildReport, SupervisorError, run_isolated};
pub use tracer::{TraceError, TraceReport, trace_callable, trace_harness};
pub use value::{ContractViolation, Value, Verdict};
