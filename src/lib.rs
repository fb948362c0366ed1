mod allocator;
mod batch;
mod config;
mod daemon;
mod error;
mod helpers;
mod logging;
mod machine;
mod netscript;
mod network;
mod oracle;
mod prep;
mod registry;
mod target;
mod tools;
mod tuner;
mod utils;

#[cfg(test)]
mod sim;

use clap::{
    error::ErrorKind::DisplayHelp,
    Parser,
};
use js_sys::Array;
use wasm_bindgen::prelude::*;

use crate::{
    config::DaemonConfig,
    daemon::Daemon,
    netscript::{
        NsWrapper,
        NS,
    },
    oracle::Oracle,
};

#[wasm_bindgen]
pub async fn execute_command(
    ns: &NS,
    args: Array,
) {
    let ns = NsWrapper::new(ns);

    let mut strargs = vec!["run hwgw.js".to_owned()];
    let strargs_iter = args.iter().filter_map(|a| {
        a.as_string()
            .or_else(|| a.as_f64().map(|f| f.to_string()))
    });
    strargs.extend(strargs_iter);

    // if the message was matched, process the message
    match AppMode::try_parse_from(strargs) {
        Err(e) if e.kind() == DisplayHelp => {
            let error_msg = format!("\n{}", clap::Error::raw(e.kind().clone(), e),);

            ns.tprint(&*error_msg);
        },

        Ok(AppMode::Daemon(config)) => {
            let config = match config.resolve() {
                Ok(config) => config,
                Err(e) => {
                    ns.notify(&format!("bad configuration: {}", e));
                    return;
                },
            };

            logging::init(config.log_level());
            if let Err(e) = Daemon::new(&ns, config).run().await {
                ns.notify(&format!("daemon stopped: {}", e));
            }
        },

        Err(e) => ns.tprint(&format!("unable to process message:\n{}", e)),
    }
}

#[derive(Parser)]
enum AppMode {
    /// Prepares targets and keeps HWGW batches running against them.
    Daemon(DaemonConfig),
}
