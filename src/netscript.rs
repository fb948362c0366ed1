use js_sys::{
    Array,
    JsString,
};
use wasm_bindgen::{
    prelude::*,
    JsValue,
};

use crate::{
    error::{
        DaemonError,
        FormulaUnavailable,
    },
    oracle::{
        Clock,
        Multipliers,
        Oracle,
        Pid,
        ProcessInfo,
        ServerProfile,
    },
    utils::{
        get_attribute,
        set_attribute,
    },
};

// thank you github.com/paulcdejean
#[wasm_bindgen]
extern "C" {
    pub type NS;

    #[wasm_bindgen(method)]
    fn tprint(
        this: &NS,
        print: &str,
    );

    #[wasm_bindgen(method)]
    fn print(
        this: &NS,
        print: &str,
    );

    #[wasm_bindgen(method)]
    fn toast(
        this: &NS,
        msg: &str,
        variant: &str,
    );

    #[wasm_bindgen(method)]
    async fn sleep(
        this: &NS,
        millis: i32,
    );

    #[wasm_bindgen(catch, method, variadic)]
    fn exec(
        this: &NS,
        script_name: &str,
        host: &str,
        num_threads: Option<i32>,
        args: Box<[JsString]>,
    ) -> Result<i32, JsValue>;

    #[wasm_bindgen(method)]
    fn kill(
        this: &NS,
        pid: i32,
    ) -> bool;

    #[wasm_bindgen(method)]
    fn ps(
        this: &NS,
        host: &str,
    ) -> Vec<JsValue>;

    #[wasm_bindgen(method)]
    fn scan(
        this: &NS,
        scan: Option<&str>,
    ) -> Vec<JsValue>;

    #[wasm_bindgen(method, js_name = hasRootAccess)]
    fn has_root_access(
        this: &NS,
        host: &str,
    ) -> bool;

    #[wasm_bindgen(catch, method)]
    fn nuke(
        this: &NS,
        host: &str,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, method)]
    fn brutessh(
        this: &NS,
        hostname: &str,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, method)]
    fn ftpcrack(
        this: &NS,
        hostname: &str,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, method)]
    fn relaysmtp(
        this: &NS,
        hostname: &str,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, method)]
    fn httpworm(
        this: &NS,
        hostname: &str,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, method)]
    fn sqlinject(
        this: &NS,
        hostname: &str,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(catch, method, js_name = getServer)]
    fn get_server(
        this: &NS,
        host: &str,
    ) -> Result<Server, JsValue>;

    #[wasm_bindgen(method, js_name = getPlayer)]
    fn get_player(this: &NS) -> Player;

    #[wasm_bindgen(catch, method, js_name = getBitNodeMultipliers)]
    fn get_bitnode_multipliers(this: &NS) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, js_name = getHackingLevel)]
    fn get_hacking_level(this: &NS) -> f64;

    #[wasm_bindgen(method, js_name = getHackTime)]
    fn get_hack_time(
        this: &NS,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(method, js_name = getGrowTime)]
    fn get_grow_time(
        this: &NS,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(method, js_name = getWeakenTime)]
    fn get_weaken_time(
        this: &NS,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(method, js_name = getServerMaxRam)]
    fn get_server_max_ram(
        this: &NS,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(method, js_name = getServerUsedRam)]
    fn get_server_used_ram(
        this: &NS,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(method, js_name = getServerSecurityLevel)]
    fn get_server_security_level(
        this: &NS,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(catch, method, js_name = getServerMoneyAvailable)]
    fn get_server_money_available(
        this: &NS,
        host: &str,
    ) -> Result<f64, JsValue>;

    #[wasm_bindgen(method, js_name = hackAnalyzeChance)]
    fn hack_analyze_chance(
        this: &NS,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(method, js_name = getScriptRam)]
    fn get_script_ram(
        this: &NS,
        script: &str,
        host: &str,
    ) -> f64;

    #[wasm_bindgen(method)]
    fn write(
        this: &NS,
        filename: &str,
        data: &str,
        mode: &str,
    );

    #[wasm_bindgen(method)]
    fn scp(
        this: &NS,
        files: &JsValue,
        destination: &str,
        source: &str,
    ) -> bool;

    #[wasm_bindgen(method, js_name = fileExists)]
    fn file_exists(
        this: &NS,
        file: &str,
        host: &str,
    ) -> bool;

    #[wasm_bindgen(method, getter)]
    fn formulas(this: &NS) -> Formulas;

    pub type Formulas;

    #[wasm_bindgen(method, getter)]
    fn hacking(this: &Formulas) -> HackingFormulas;

    pub type HackingFormulas;

    #[wasm_bindgen(catch, method, js_name = hackPercent)]
    fn hack_percent(
        this: &HackingFormulas,
        server: &Server,
        player: &Player,
    ) -> Result<f64, JsValue>;

    pub type Server;

    pub type Player;

    pub type Date;

    #[wasm_bindgen(static_method_of = Date)]
    pub fn now() -> f64;
}

/// Reads a multiplier from a JS object, defaulting to 1.
fn mult(
    object: &JsValue,
    field: &str,
) -> f64 {
    get_attribute(object, field, JsValue::as_f64).unwrap_or(1.)
}

fn js_to_string(value: &JsValue) -> String {
    match value.as_string() {
        Some(s) => s,
        None => value
            .as_f64()
            .map(|f| f.to_string())
            .unwrap_or_default(),
    }
}

pub struct NsWrapper<'a>(&'a NS);

impl<'a> NsWrapper<'a> {
    pub fn new(ns: &'a NS) -> NsWrapper<'a> {
        NsWrapper(ns)
    }

    pub fn tprint(
        &self,
        text: &str,
    ) {
        self.0.tprint(text);
    }

    fn profile_of(
        &self,
        host: &str,
        server: &Server,
    ) -> Result<ServerProfile, DaemonError> {
        let missing = |what| DaemonError::Oracle {
            host: host.to_owned(),
            what,
        };
        let number = |field, what| get_attribute(server, field, JsValue::as_f64).ok_or(missing(what));

        let hostname = get_attribute(server, "hostname", JsValue::as_string)
            .ok_or(missing("hostname"))?;

        Ok(ServerProfile {
            low_priority: hostname.starts_with("hacknet-"),
            max_money: number("moneyMax", "moneyMax").unwrap_or(0.),
            min_security: number("minDifficulty", "minDifficulty").unwrap_or(1.),
            growth: number("serverGrowth", "serverGrowth").unwrap_or(0.),
            required_hacking_level: number("requiredHackingSkill", "requiredHackingSkill")?
                as u32,
            required_open_ports: number("numOpenPortsRequired", "numOpenPortsRequired")
                .unwrap_or(0.) as usize,
            player_owned: get_attribute(server, "purchasedByPlayer", JsValue::as_bool)
                .unwrap_or(false),
            cpu_cores: number("cpuCores", "cpuCores").unwrap_or(1.) as usize,
            hostname,
        })
    }
}

impl<'a> Clock for NsWrapper<'a> {
    fn now(&self) -> f64 {
        Date::now()
    }
}

impl<'a> Oracle for NsWrapper<'a> {
    fn scan(
        &self,
        host: &str,
    ) -> Vec<String> {
        self.0
            .scan(Some(host))
            .into_iter()
            .filter_map(|m| m.as_string())
            .collect()
    }

    fn server_profile(
        &self,
        host: &str,
    ) -> Result<ServerProfile, DaemonError> {
        let server = self.0.get_server(host).map_err(|_| DaemonError::Oracle {
            host: host.to_owned(),
            what: "getServer threw",
        })?;

        self.profile_of(host, &server)
    }

    fn has_root(
        &self,
        host: &str,
    ) -> bool {
        self.0.has_root_access(host)
    }

    fn try_root(
        &self,
        host: &str,
    ) -> bool {
        // each of these throws when its program is missing
        let _ = self.0.brutessh(host);
        let _ = self.0.ftpcrack(host);
        let _ = self.0.relaysmtp(host);
        let _ = self.0.httpworm(host);
        let _ = self.0.sqlinject(host);
        let _ = self.0.nuke(host);

        self.0.has_root_access(host)
    }

    fn security_level(
        &self,
        host: &str,
    ) -> f64 {
        self.0.get_server_security_level(host)
    }

    fn money_available(
        &self,
        host: &str,
    ) -> f64 {
        self.0.get_server_money_available(host).unwrap_or(0.)
    }

    fn max_ram(
        &self,
        host: &str,
    ) -> f64 {
        self.0.get_server_max_ram(host)
    }

    fn used_ram(
        &self,
        host: &str,
    ) -> f64 {
        self.0.get_server_used_ram(host)
    }

    fn hacking_level(&self) -> u32 {
        self.0.get_hacking_level().max(0.) as u32
    }

    fn multipliers(&self) -> Multipliers {
        let player = self.0.get_player();
        let player_mults = get_attribute(&player, "mults", |m| Some(m.clone()))
            .filter(|m| m.is_object())
            .unwrap_or_else(|| player.clone().into());
        let bitnode = self.0.get_bitnode_multipliers().unwrap_or(JsValue::UNDEFINED);

        Multipliers {
            hacking_money: mult(&player_mults, "hacking_money"),
            hacking_grow: mult(&player_mults, "hacking_grow"),
            script_hack_money: mult(&bitnode, "ScriptHackMoney"),
            server_growth_rate: mult(&bitnode, "ServerGrowthRate"),
            server_weaken_rate: mult(&bitnode, "ServerWeakenRate"),
        }
    }

    fn hack_time(
        &self,
        host: &str,
    ) -> f64 {
        self.0.get_hack_time(host)
    }

    fn grow_time(
        &self,
        host: &str,
    ) -> f64 {
        self.0.get_grow_time(host)
    }

    fn weaken_time(
        &self,
        host: &str,
    ) -> f64 {
        self.0.get_weaken_time(host)
    }

    fn hack_chance(
        &self,
        host: &str,
    ) -> f64 {
        self.0.hack_analyze_chance(host)
    }

    fn hack_percent_at_min_security(
        &self,
        host: &str,
    ) -> Result<f64, FormulaUnavailable> {
        let server = self.0.get_server(host).map_err(|_| FormulaUnavailable)?;
        let min_security =
            get_attribute(&server, "minDifficulty", JsValue::as_f64).ok_or(FormulaUnavailable)?;
        set_attribute(&server, "hackDifficulty", &JsValue::from_f64(min_security));

        let player = self.0.get_player();
        self.0
            .formulas()
            .hacking()
            .hack_percent(&server, &player)
            .map_err(|_| FormulaUnavailable)
    }

    fn exec(
        &self,
        script: &str,
        host: &str,
        threads: usize,
        args: &[String],
    ) -> Option<Pid> {
        let args = args
            .iter()
            .map(|a| JsString::from(a.as_str()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        match self.0.exec(script, host, Some(threads as i32), args) {
            Ok(pid) if 0 < pid => Some(pid as Pid),
            _ => None,
        }
    }

    fn kill(
        &self,
        pid: Pid,
    ) -> bool {
        self.0.kill(pid as i32)
    }

    fn processes(
        &self,
        host: &str,
    ) -> Vec<ProcessInfo> {
        self.0
            .ps(host)
            .into_iter()
            .filter_map(|p| {
                Some(ProcessInfo {
                    pid: get_attribute(&p, "pid", JsValue::as_f64)? as Pid,
                    filename: get_attribute(&p, "filename", JsValue::as_string)?,
                    threads: get_attribute(&p, "threads", JsValue::as_f64).unwrap_or(1.)
                        as usize,
                    args: get_attribute(&p, "args", |a| {
                        Some(Array::from(a).iter().map(|v| js_to_string(&v)).collect())
                    })
                    .unwrap_or_default(),
                })
            })
            .collect()
    }

    fn script_ram(
        &self,
        script: &str,
        host: &str,
    ) -> f64 {
        self.0.get_script_ram(script, host)
    }

    fn file_exists(
        &self,
        file: &str,
        host: &str,
    ) -> bool {
        self.0.file_exists(file, host)
    }

    fn write_file(
        &self,
        file: &str,
        contents: &str,
    ) {
        self.0.write(file, contents, "w");
    }

    fn copy_files(
        &self,
        files: &[&str],
        destination: &str,
        source: &str,
    ) -> bool {
        let files = files
            .iter()
            .map(|f| JsValue::from_str(f))
            .collect::<Array>();

        self.0.scp(&files, destination, source)
    }

    fn print(
        &self,
        text: &str,
    ) {
        self.0.print(text);
    }

    fn notify(
        &self,
        text: &str,
    ) {
        self.0.tprint(text);
        self.0.toast(text, "warning");
    }

    async fn sleep(
        &self,
        millis: f64,
    ) {
        self.0.sleep(millis.round().max(0.) as i32).await;
    }
}
