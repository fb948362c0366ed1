//! Worker scripts and what they cost.

use log::debug;

use crate::{
    error::DaemonError,
    oracle::{
        Oracle,
        HOME,
    },
    utils::gb_to_hundredths_ceil,
};

pub struct DynamicFile<'a> {
    pub filename: &'a str,
    pub contents: &'a str,
}

impl<'a> DynamicFile<'a> {
    /// Writes the script onto home, replacing whatever is there.
    pub fn write_home(
        &self,
        oracle: &impl Oracle,
    ) -> bool {
        oracle.write_file(self.filename, self.contents);
        oracle.file_exists(self.filename, HOME)
    }

    pub fn deploy_to_node(
        &self,
        oracle: &impl Oracle,
        hostname: &str,
    ) -> bool {
        if oracle.file_exists(self.filename, hostname) {
            return true;
        }

        oracle.copy_files(&[self.filename], hostname, HOME);
        oracle.file_exists(self.filename, hostname)
    }
}

pub const WEAKEN_SCRIPT: DynamicFile<'static> = DynamicFile {
    filename: "worker-weaken.js",
    contents: include_str!("workers/worker-weaken.js"),
};

pub const GROW_SCRIPT: DynamicFile<'static> = DynamicFile {
    filename: "worker-grow.js",
    contents: include_str!("workers/worker-grow.js"),
};

pub const HACK_SCRIPT: DynamicFile<'static> = DynamicFile {
    filename: "worker-hack.js",
    contents: include_str!("workers/worker-hack.js"),
};

pub const XP_SCRIPT: DynamicFile<'static> = DynamicFile {
    filename: "worker-xp.js",
    contents: include_str!("workers/worker-xp.js"),
};

pub const SHARE_SCRIPT: DynamicFile<'static> = DynamicFile {
    filename: "worker-share.js",
    contents: include_str!("workers/worker-share.js"),
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Weaken,
    Grow,
    Hack,
    ExperienceHack,
    Share,
}

pub struct Tool {
    pub short_name: &'static str,
    pub script: &'static DynamicFile<'static>,
    /// RAM per thread, in hundredths of a GB.
    pub ram_hundredths: u64,
    /// Whether one launch may be spread over several nodes.
    pub can_split: bool,
    /// Whether it may eat into the RAM reserved on home.
    pub ignore_reserved: bool,
}

pub static TOOLS: [Tool; 5] = [
    Tool {
        short_name: "weak",
        script: &WEAKEN_SCRIPT,
        ram_hundredths: 175,
        can_split: true,
        ignore_reserved: false,
    },
    Tool {
        short_name: "grow",
        script: &GROW_SCRIPT,
        ram_hundredths: 175,
        can_split: false,
        ignore_reserved: false,
    },
    Tool {
        short_name: "hack",
        script: &HACK_SCRIPT,
        ram_hundredths: 170,
        can_split: false,
        ignore_reserved: false,
    },
    Tool {
        short_name: "xp",
        script: &XP_SCRIPT,
        ram_hundredths: 175,
        can_split: true,
        ignore_reserved: false,
    },
    Tool {
        short_name: "share",
        script: &SHARE_SCRIPT,
        ram_hundredths: 400,
        can_split: true,
        ignore_reserved: false,
    },
];

impl ToolKind {
    pub fn tool(&self) -> &'static Tool {
        use ToolKind::*;

        match self {
            Weaken => &TOOLS[0],
            Grow => &TOOLS[1],
            Hack => &TOOLS[2],
            ExperienceHack => &TOOLS[3],
            Share => &TOOLS[4],
        }
    }

    pub fn ram_hundredths(&self) -> u64 {
        self.tool().ram_hundredths
    }

    pub fn can_split(&self) -> bool {
        self.tool().can_split
    }

    #[cfg(test)]
    pub fn script_name(&self) -> &'static str {
        self.tool().script.filename
    }
}

/// Writes every worker onto home and checks the game agrees on their cost.
///
/// A worker that can't be written or costs more than the catalog claims makes
/// every allocation wrong, so this is fatal.
pub fn install_tools(oracle: &impl Oracle) -> Result<(), DaemonError> {
    for tool in TOOLS.iter() {
        if !tool.script.write_home(oracle) {
            return Err(DaemonError::Setup(format!(
                "could not write {} to {}",
                tool.script.filename, HOME
            )));
        }

        let reported = oracle.script_ram(tool.script.filename, HOME);
        if reported <= 0. {
            return Err(DaemonError::Setup(format!(
                "{} reports no RAM cost",
                tool.script.filename
            )));
        }

        if tool.ram_hundredths < gb_to_hundredths_ceil(reported) {
            return Err(DaemonError::Setup(format!(
                "{} costs {:.2}GB but the catalog assumes {:.2}GB",
                tool.script.filename,
                reported,
                tool.ram_hundredths as f64 / 100.
            )));
        }

        debug!("installed {} ({:.2}GB)", tool.short_name, reported);
    }

    Ok(())
}

pub fn all_script_names() -> Vec<&'static str> {
    TOOLS.iter().map(|t| t.script.filename).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimOracle;

    #[test]
    fn catalog_lookup_matches_kind() {
        let names = [
            ToolKind::Weaken,
            ToolKind::Grow,
            ToolKind::Hack,
            ToolKind::ExperienceHack,
            ToolKind::Share,
        ]
        .map(|kind| kind.tool().short_name);
        assert_eq!(names, ["weak", "grow", "hack", "xp", "share"]);

        assert!(ToolKind::Weaken.can_split());
        assert!(!ToolKind::Grow.can_split());
        assert!(!ToolKind::Hack.can_split());
    }

    #[test]
    fn install_writes_every_script() {
        let oracle = SimOracle::new();
        install_tools(&oracle).unwrap();

        for name in all_script_names() {
            assert!(oracle.file_exists(name, HOME));
        }
    }

    #[test]
    fn install_rejects_underpriced_scripts() {
        let oracle = SimOracle::new();
        oracle.set_script_ram(HACK_SCRIPT.filename, 2.5);

        let err = install_tools(&oracle).unwrap_err();
        assert!(matches!(err, DaemonError::Setup(_)));
    }

    #[test]
    fn deploy_copies_once() {
        let oracle = SimOracle::new();
        oracle.add_node("n00dles", 4.);
        install_tools(&oracle).unwrap();

        assert!(!oracle.file_exists(GROW_SCRIPT.filename, "n00dles"));
        assert!(GROW_SCRIPT.deploy_to_node(&oracle, "n00dles"));
        assert!(GROW_SCRIPT.deploy_to_node(&oracle, "n00dles"));
        assert_eq!(oracle.copy_count(), 1);
    }
}
