//! Validation Failure Interpretation — turns an externally-produced heavy
//! validation verdict into semantic clusters the correction classifier and
//! policy can act on. Running the checks themselves is out of scope here;
//! this module only interprets their output.

pub mod interpreter;

pub use interpreter::{
    extract_import_signal, extract_ts_code, interpret, CheckResult, Cluster, ClusterType,
    HeavyValidationVerdict, ImportSignal, RawFailure, ValidationProfile,
};
