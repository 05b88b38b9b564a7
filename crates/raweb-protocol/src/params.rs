//! Mapping of descriptor + negotiated values onto guacd's `connect` arguments.
//!
//! guacd answers `select` with an `args` instruction listing the protocol
//! version followed by the parameter names it accepts, in order. The
//! `connect` reply must echo the version and supply one value per name in
//! exactly that order. Each known name has one [`Rule`] in [`PARAMETERS`];
//! unknown names get an empty value, which guacd treats as "use default".

use crate::descriptor::{ConnectionDescriptor, TargetAddress};
use crate::error::{DescriptorError, MappingError};
use crate::instruction::Instruction;
use crate::session::NegotiatedSession;

/// The only guacd protocol version this tunnel speaks.
pub const SUPPORTED_VERSION: &str = "VERSION_1_5_0";

/// Client name reported to the RDP server.
pub const CLIENT_NAME: &str = "RAWeb";

// ---------------------------------------------------------------------------
// args advertisement
// ---------------------------------------------------------------------------

/// Parsed `args` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgsAdvert {
    pub version: String,
    pub names: Vec<String>,
}

impl ArgsAdvert {
    pub fn from_instruction(instruction: &Instruction) -> Result<Self, MappingError> {
        if instruction.opcode() != "args" {
            return Err(MappingError::NotArgs(instruction.opcode().to_string()));
        }
        let (version, names) = match instruction.args().split_first() {
            Some((v, rest)) => (v.clone(), rest.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Ok(Self { version, names })
    }

    pub fn check_version(&self) -> Result<(), MappingError> {
        if self.version == SUPPORTED_VERSION {
            Ok(())
        } else {
            Err(MappingError::UnsupportedVersion(self.version.clone()))
        }
    }
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum SessionValue {
    Domain,
    Username,
    Password,
    Width,
    Height,
    Dpi,
    Timezone,
    GatewayDomain,
    GatewayUsername,
    GatewayPassword,
}

/// How one guacd parameter is derived.
#[derive(Clone, Copy)]
enum Rule {
    /// Descriptor string value, verbatim.
    Property(&'static str),
    /// Integer switch: non-zero → `true`, zero → `false`, absent → empty.
    Switch(&'static str),
    /// Inverted integer switch (`disable ...` properties feeding `enable-...`).
    InvertedSwitch(&'static str),
    Session(SessionValue),
    Const(&'static str),
    Computed(fn(&MappingContext<'_>) -> String),
}

const PARAMETERS: &[(&str, Rule)] = &[
    ("hostname", Rule::Computed(target_host)),
    ("port", Rule::Computed(target_port)),
    ("domain", Rule::Session(SessionValue::Domain)),
    ("username", Rule::Session(SessionValue::Username)),
    ("password", Rule::Session(SessionValue::Password)),
    ("width", Rule::Session(SessionValue::Width)),
    ("height", Rule::Session(SessionValue::Height)),
    ("dpi", Rule::Session(SessionValue::Dpi)),
    ("timezone", Rule::Session(SessionValue::Timezone)),
    ("security", Rule::Const("any")),
    // The tunnel verifies the certificate itself before guacd is involved.
    ("ignore-cert", Rule::Const("true")),
    ("client-name", Rule::Const(CLIENT_NAME)),
    ("disable-audio", Rule::Computed(disable_audio)),
    ("enable-audio-input", Rule::Switch("audiocapturemode")),
    ("console", Rule::Computed(console_session)),
    ("initial-program", Rule::Computed(initial_program)),
    ("remote-app", Rule::Computed(remote_app)),
    ("remote-app-dir", Rule::Computed(remote_app_dir)),
    ("remote-app-args", Rule::Computed(remote_app_args)),
    ("color-depth", Rule::Computed(color_depth)),
    ("resize-method", Rule::Computed(resize_method)),
    ("enable-wallpaper", Rule::InvertedSwitch("disable wallpaper")),
    ("enable-theming", Rule::InvertedSwitch("disable themes")),
    ("enable-font-smoothing", Rule::Switch("allow font smoothing")),
    ("enable-full-window-drag", Rule::InvertedSwitch("disable full window drag")),
    ("enable-desktop-composition", Rule::Switch("allow desktop composition")),
    ("enable-menu-animations", Rule::InvertedSwitch("disable menu anims")),
    ("enable-printing", Rule::Switch("redirectprinters")),
    ("disable-copy", Rule::InvertedSwitch("redirectclipboard")),
    ("disable-paste", Rule::InvertedSwitch("redirectclipboard")),
    ("load-balance-info", Rule::Property("loadbalanceinfo")),
    ("gateway-hostname", Rule::Computed(gateway_hostname)),
    ("gateway-port", Rule::Computed(gateway_port)),
    ("gateway-domain", Rule::Session(SessionValue::GatewayDomain)),
    ("gateway-username", Rule::Session(SessionValue::GatewayUsername)),
    ("gateway-password", Rule::Session(SessionValue::GatewayPassword)),
];

fn lookup(name: &str) -> Option<Rule> {
    PARAMETERS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, rule)| *rule)
}

fn bool_str(value: bool) -> String {
    String::from(if value { "true" } else { "false" })
}

fn target_host(ctx: &MappingContext<'_>) -> String {
    ctx.target.host.clone()
}

fn target_port(ctx: &MappingContext<'_>) -> String {
    ctx.target.port.to_string()
}

fn disable_audio(ctx: &MappingContext<'_>) -> String {
    // audiomode: 0 = play here, 1 = leave on remote, 2 = do not play.
    match ctx.descriptor.int_value("audiomode") {
        Some(0) | None => bool_str(false),
        Some(_) => bool_str(true),
    }
}

fn console_session(ctx: &MappingContext<'_>) -> String {
    let d = ctx.descriptor;
    let admin = d.flag("administrative session").unwrap_or(false)
        || d.flag("connect to console").unwrap_or(false);
    bool_str(admin)
}

fn initial_program(ctx: &MappingContext<'_>) -> String {
    if ctx.descriptor.remote_app_mode() {
        return String::new();
    }
    ctx.descriptor
        .str_value("alternate shell")
        .unwrap_or_default()
        .to_string()
}

fn remote_app(ctx: &MappingContext<'_>) -> String {
    remote_app_property(ctx, |d| d.remote_app_program())
}

fn remote_app_dir(ctx: &MappingContext<'_>) -> String {
    remote_app_property(ctx, |d| d.str_value("shell working directory"))
}

fn remote_app_args(ctx: &MappingContext<'_>) -> String {
    remote_app_property(ctx, |d| d.remote_app_cmdline())
}

fn remote_app_property(
    ctx: &MappingContext<'_>,
    get: impl for<'a> Fn(&'a ConnectionDescriptor) -> Option<&'a str>,
) -> String {
    if !ctx.descriptor.remote_app_mode() {
        return String::new();
    }
    get(ctx.descriptor).unwrap_or_default().to_string()
}

fn color_depth(ctx: &MappingContext<'_>) -> String {
    match ctx.descriptor.int_value("session bpp") {
        Some(bpp @ (8 | 16 | 24 | 32)) => bpp.to_string(),
        Some(15) => "16".to_string(),
        _ => String::new(),
    }
}

fn resize_method(ctx: &MappingContext<'_>) -> String {
    if ctx.descriptor.flag("dynamic resolution").unwrap_or(true) {
        "display-update".to_string()
    } else {
        String::new()
    }
}

fn gateway_hostname(ctx: &MappingContext<'_>) -> String {
    ctx.gateway
        .as_ref()
        .map(|g| g.host.clone())
        .unwrap_or_default()
}

fn gateway_port(ctx: &MappingContext<'_>) -> String {
    ctx.gateway
        .as_ref()
        .map(|g| g.port.to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reject descriptor combinations guacd cannot honour.
pub fn validate_descriptor(descriptor: &ConnectionDescriptor) -> Result<(), MappingError> {
    if !descriptor.remote_app_mode() {
        return Ok(());
    }

    let program = descriptor
        .remote_app_program()
        .ok_or(MappingError::RemoteAppProgramMissing)?;
    if descriptor.remote_app_file().is_some() {
        return Err(MappingError::RemoteAppFileNotAllowed);
    }
    if !descriptor.remote_app_expands_remotely() {
        return Err(MappingError::RemoteAppExpansionNotRemote);
    }

    let cmdline = descriptor.remote_app_cmdline().unwrap_or_default();
    if is_packaged_app_launcher(program) != is_packaged_app_cmdline(cmdline) {
        return Err(MappingError::PackagedAppMismatch {
            program: program.to_string(),
            cmdline: cmdline.to_string(),
        });
    }
    Ok(())
}

/// Packaged (MSIX/Store) apps are started through the shell:
/// `explorer.exe shell:AppsFolder\<AUMID>`.
fn is_packaged_app_launcher(program: &str) -> bool {
    let program = program.trim().trim_start_matches("||");
    let name = program
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(program)
        .to_ascii_lowercase();
    name == "explorer.exe" || name == "explorer"
}

fn is_packaged_app_cmdline(cmdline: &str) -> bool {
    cmdline
        .trim()
        .trim_matches('"')
        .to_ascii_lowercase()
        .starts_with("shell:appsfolder\\")
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

/// Inputs available to every rule.
pub struct MappingContext<'a> {
    pub descriptor: &'a ConnectionDescriptor,
    pub session: &'a NegotiatedSession,
    /// Address guacd should dial (possibly already resolved to IPv4).
    pub target: &'a TargetAddress,
    gateway: Option<TargetAddress>,
}

impl<'a> MappingContext<'a> {
    pub fn new(
        descriptor: &'a ConnectionDescriptor,
        session: &'a NegotiatedSession,
        target: &'a TargetAddress,
    ) -> Result<Self, DescriptorError> {
        Ok(Self {
            descriptor,
            session,
            target,
            gateway: descriptor.gateway()?,
        })
    }

    fn session_value(&self, value: SessionValue) -> String {
        let s = self.session;
        let gw = s.gateway.as_ref();
        match value {
            SessionValue::Domain => {
                if s.credentials.domain.is_empty() {
                    self.descriptor
                        .str_value("domain")
                        .unwrap_or_default()
                        .to_string()
                } else {
                    s.credentials.domain.clone()
                }
            }
            SessionValue::Username => s.credentials.username.clone(),
            SessionValue::Password => s.credentials.password.clone(),
            SessionValue::Width => s.display.width.to_string(),
            SessionValue::Height => s.display.height.to_string(),
            SessionValue::Dpi => s.display.dpi.to_string(),
            SessionValue::Timezone => s.timezone.clone(),
            SessionValue::GatewayDomain => gw.map(|g| g.domain.clone()).unwrap_or_default(),
            SessionValue::GatewayUsername => gw.map(|g| g.username.clone()).unwrap_or_default(),
            SessionValue::GatewayPassword => gw.map(|g| g.password.clone()).unwrap_or_default(),
        }
    }

    fn value_for(&self, name: &str) -> String {
        let Some(rule) = lookup(name) else {
            return String::new();
        };
        match rule {
            Rule::Property(key) => self
                .descriptor
                .str_value(key)
                .unwrap_or_default()
                .to_string(),
            Rule::Switch(key) => self.descriptor.flag(key).map(bool_str).unwrap_or_default(),
            Rule::InvertedSwitch(key) => self
                .descriptor
                .flag(key)
                .map(|on| bool_str(!on))
                .unwrap_or_default(),
            Rule::Session(value) => self.session_value(value),
            Rule::Const(value) => value.to_string(),
            Rule::Computed(derive) => derive(self),
        }
    }

    /// One value per advertised name, in advertised order.
    pub fn map(&self, advert: &ArgsAdvert) -> Result<Vec<String>, MappingError> {
        advert.check_version()?;
        validate_descriptor(self.descriptor)?;
        Ok(advert.names.iter().map(|n| self.value_for(n)).collect())
    }

    /// The full `connect` instruction for `advert`.
    pub fn connect_instruction(&self, advert: &ArgsAdvert) -> Result<Instruction, MappingError> {
        let values = self.map(advert)?;
        Ok(Instruction::new(
            "connect",
            std::iter::once(SUPPORTED_VERSION.to_string()).chain(values),
        ))
    }
}
