#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use flowctl_control::*;
pub use flowctl_node::*;
pub use flowctl_rpc::*;

pub use flowctl_common as common;
pub use flowctl_tc as tc;
pub use flowctl_wire as wire;
