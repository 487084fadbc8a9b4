use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The external native libraries a seed can exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetLibrary {
    Zlib,
    Sqlite,
    Libpng,
    CJson,
    Lcms,
    Libpcap,
    Re2,
    Unity,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown target library '{0}'")]
pub struct UnknownLibrary(pub String);

impl TargetLibrary {
    pub const ALL: [TargetLibrary; 8] = [
        TargetLibrary::Zlib,
        TargetLibrary::Sqlite,
        TargetLibrary::Libpng,
        TargetLibrary::CJson,
        TargetLibrary::Lcms,
        TargetLibrary::Libpcap,
        TargetLibrary::Re2,
        TargetLibrary::Unity,
    ];

    /// Canonical token used inside `test_<token>_api_sequence`.
    pub fn token(&self) -> &'static str {
        match self {
            TargetLibrary::Zlib => "zlib",
            TargetLibrary::Sqlite => "sqlite",
            TargetLibrary::Libpng => "libpng",
            TargetLibrary::CJson => "cJSON",
            TargetLibrary::Lcms => "lcms",
            TargetLibrary::Libpcap => "libpcap",
            TargetLibrary::Re2 => "re2",
            TargetLibrary::Unity => "unity",
        }
    }

    pub fn function_name(&self) -> String {
        format!("test_{}_api_sequence", self.token())
    }

    pub fn default_link_flags(&self) -> Vec<String> {
        let flags: &[&str] = match self {
            TargetLibrary::Zlib => &["-lz"],
            TargetLibrary::Sqlite => &["-lsqlite3"],
            TargetLibrary::Libpng => &["-lpng"],
            TargetLibrary::CJson => &["-lcjson"],
            TargetLibrary::Lcms => &["-llcms2"],
            TargetLibrary::Libpcap => &["-lpcap"],
            TargetLibrary::Re2 => &["-lcre2", "-lre2"],
            TargetLibrary::Unity => &[],
        };
        flags.iter().map(|f| f.to_string()).collect()
    }
}

impl fmt::Display for TargetLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for TargetLibrary {
    type Err = UnknownLibrary;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let library = match lowered.as_str() {
            "zlib" => TargetLibrary::Zlib,
            "sqlite" | "sqlite3" => TargetLibrary::Sqlite,
            "libpng" | "png" => TargetLibrary::Libpng,
            "cjson" => TargetLibrary::CJson,
            "lcms" | "lcms2" => TargetLibrary::Lcms,
            "libpcap" | "pcap" => TargetLibrary::Libpcap,
            "re2" | "cre2" => TargetLibrary::Re2,
            "unity" | "testframework" => TargetLibrary::Unity,
            _ => return Err(UnknownLibrary(s.to_string())),
        };
        Ok(library)
    }
}

impl TryFrom<String> for TargetLibrary {
    type Error = UnknownLibrary;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetLibrary> for String {
    fn from(library: TargetLibrary) -> Self {
        library.token().to_string()
    }
}

/// Where the handle of a resource lives relative to the call that touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleSite {
    /// The call's return value, bound to a variable.
    Return,
    /// An argument, usually an out-parameter such as `&db`.
    Arg(usize),
    /// A library-global session with no handle variable.
    Session(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct AcquireSpec {
    pub function: &'static str,
    pub site: HandleSite,
}

impl AcquireSpec {
    /// Whether the handle must still be released after the call reports
    /// failure (`sqlite3_open` allocates a connection even when it fails).
    pub fn held_on_failure(&self) -> bool {
        HELD_ON_FAILURE.contains(&self.function)
    }
}

const HELD_ON_FAILURE: &[&str] = &["sqlite3_open", "sqlite3_open_v2", "sqlite3_open16"];

#[derive(Debug, Clone, Copy)]
pub struct ReleaseSpec {
    pub function: &'static str,
    pub sites: &'static [HandleSite],
}

/// A call that creates a file on disk. `mode_arg` must contain `w` or `a`
/// for the call to count as a creation.
#[derive(Debug, Clone, Copy)]
pub struct TempFileSpec {
    pub function: &'static str,
    pub path_arg: usize,
    pub mode_arg: Option<usize>,
}

/// Deliberate perturbations a seed can apply to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeCaseKind {
    NullArgument,
    ZeroLength,
    DoubleRelease,
    UseAfterRelease,
    Unclassified,
}

impl EdgeCaseKind {
    pub fn describe(&self) -> &'static str {
        match self {
            EdgeCaseKind::NullArgument => "NULL argument",
            EdgeCaseKind::ZeroLength => "zero length",
            EdgeCaseKind::DoubleRelease => "double release",
            EdgeCaseKind::UseAfterRelease => "use after release",
            EdgeCaseKind::Unclassified => "unclassified",
        }
    }
}

use HandleSite::{Arg, Return, Session};

const ACQUIRES: &[AcquireSpec] = &[
    // zlib
    AcquireSpec { function: "deflateInit_", site: Arg(0) },
    AcquireSpec { function: "deflateInit2_", site: Arg(0) },
    AcquireSpec { function: "deflateInit", site: Arg(0) },
    AcquireSpec { function: "deflateInit2", site: Arg(0) },
    AcquireSpec { function: "inflateInit_", site: Arg(0) },
    AcquireSpec { function: "inflateInit2_", site: Arg(0) },
    AcquireSpec { function: "inflateInit", site: Arg(0) },
    AcquireSpec { function: "inflateInit2", site: Arg(0) },
    AcquireSpec { function: "inflateBackInit_", site: Arg(0) },
    AcquireSpec { function: "gzopen", site: Return },
    AcquireSpec { function: "gzdopen", site: Return },
    // sqlite
    AcquireSpec { function: "sqlite3_open", site: Arg(1) },
    AcquireSpec { function: "sqlite3_open_v2", site: Arg(1) },
    AcquireSpec { function: "sqlite3_open16", site: Arg(1) },
    AcquireSpec { function: "sqlite3_prepare", site: Arg(3) },
    AcquireSpec { function: "sqlite3_prepare_v2", site: Arg(3) },
    AcquireSpec { function: "sqlite3_prepare_v3", site: Arg(4) },
    AcquireSpec { function: "sqlite3_exec", site: Arg(4) },
    AcquireSpec { function: "sqlite3_mprintf", site: Return },
    AcquireSpec { function: "sqlite3_malloc", site: Return },
    AcquireSpec { function: "sqlite3_backup_init", site: Return },
    AcquireSpec { function: "sqlite3_blob_open", site: Arg(6) },
    // libpng
    AcquireSpec { function: "png_create_read_struct", site: Return },
    AcquireSpec { function: "png_create_write_struct", site: Return },
    AcquireSpec { function: "png_create_info_struct", site: Return },
    // cJSON
    AcquireSpec { function: "cJSON_Parse", site: Return },
    AcquireSpec { function: "cJSON_ParseWithLength", site: Return },
    AcquireSpec { function: "cJSON_ParseWithOpts", site: Return },
    AcquireSpec { function: "cJSON_Duplicate", site: Return },
    AcquireSpec { function: "cJSON_CreateObject", site: Return },
    AcquireSpec { function: "cJSON_CreateArray", site: Return },
    AcquireSpec { function: "cJSON_CreateString", site: Return },
    AcquireSpec { function: "cJSON_CreateNumber", site: Return },
    AcquireSpec { function: "cJSON_CreateNull", site: Return },
    AcquireSpec { function: "cJSON_CreateTrue", site: Return },
    AcquireSpec { function: "cJSON_CreateFalse", site: Return },
    AcquireSpec { function: "cJSON_CreateBool", site: Return },
    AcquireSpec { function: "cJSON_CreateRaw", site: Return },
    AcquireSpec { function: "cJSON_CreateIntArray", site: Return },
    AcquireSpec { function: "cJSON_CreateStringArray", site: Return },
    AcquireSpec { function: "cJSON_Print", site: Return },
    AcquireSpec { function: "cJSON_PrintUnformatted", site: Return },
    AcquireSpec { function: "cJSON_PrintBuffered", site: Return },
    // Little CMS
    AcquireSpec { function: "cmsOpenProfileFromFile", site: Return },
    AcquireSpec { function: "cmsOpenProfileFromMem", site: Return },
    AcquireSpec { function: "cmsCreate_sRGBProfile", site: Return },
    AcquireSpec { function: "cmsCreateLab4Profile", site: Return },
    AcquireSpec { function: "cmsCreateLab2Profile", site: Return },
    AcquireSpec { function: "cmsCreateXYZProfile", site: Return },
    AcquireSpec { function: "cmsCreateGrayProfile", site: Return },
    AcquireSpec { function: "cmsCreateRGBProfile", site: Return },
    AcquireSpec { function: "cmsCreateNULLProfile", site: Return },
    AcquireSpec { function: "cmsCreateProfilePlaceholder", site: Return },
    AcquireSpec { function: "cmsCreateTransform", site: Return },
    AcquireSpec { function: "cmsCreateTransformTHR", site: Return },
    AcquireSpec { function: "cmsCreateProofingTransform", site: Return },
    AcquireSpec { function: "cmsCreateMultiprofileTransform", site: Return },
    AcquireSpec { function: "cmsIT8Alloc", site: Return },
    AcquireSpec { function: "cmsIT8LoadFromFile", site: Return },
    AcquireSpec { function: "cmsIT8LoadFromMem", site: Return },
    AcquireSpec { function: "cmsBuildGamma", site: Return },
    AcquireSpec { function: "cmsBuildParametricToneCurve", site: Return },
    AcquireSpec { function: "cmsBuildTabulatedToneCurve16", site: Return },
    AcquireSpec { function: "cmsPipelineAlloc", site: Return },
    AcquireSpec { function: "cmsMLUalloc", site: Return },
    AcquireSpec { function: "cmsCreateContext", site: Return },
    // libpcap
    AcquireSpec { function: "pcap_open_dead", site: Return },
    AcquireSpec { function: "pcap_open_dead_with_tstamp_precision", site: Return },
    AcquireSpec { function: "pcap_open_live", site: Return },
    AcquireSpec { function: "pcap_open_offline", site: Return },
    AcquireSpec { function: "pcap_fopen_offline", site: Return },
    AcquireSpec { function: "pcap_create", site: Return },
    AcquireSpec { function: "pcap_dump_open", site: Return },
    AcquireSpec { function: "pcap_compile", site: Arg(1) },
    AcquireSpec { function: "pcap_findalldevs", site: Arg(0) },
    // RE2 (cre2)
    AcquireSpec { function: "cre2_new", site: Return },
    AcquireSpec { function: "cre2_opt_new", site: Return },
    AcquireSpec { function: "cre2_set_new", site: Return },
    // Unity
    AcquireSpec { function: "UnityBegin", site: Session("unity") },
    // libc
    AcquireSpec { function: "malloc", site: Return },
    AcquireSpec { function: "calloc", site: Return },
    AcquireSpec { function: "strdup", site: Return },
    AcquireSpec { function: "fopen", site: Return },
    AcquireSpec { function: "tmpfile", site: Return },
];

const ARG0: &[HandleSite] = &[Arg(0)];

const RELEASES: &[ReleaseSpec] = &[
    ReleaseSpec { function: "deflateEnd", sites: ARG0 },
    ReleaseSpec { function: "inflateEnd", sites: ARG0 },
    ReleaseSpec { function: "inflateBackEnd", sites: ARG0 },
    ReleaseSpec { function: "gzclose", sites: ARG0 },
    ReleaseSpec { function: "gzclose_r", sites: ARG0 },
    ReleaseSpec { function: "gzclose_w", sites: ARG0 },
    ReleaseSpec { function: "sqlite3_close", sites: ARG0 },
    ReleaseSpec { function: "sqlite3_close_v2", sites: ARG0 },
    ReleaseSpec { function: "sqlite3_finalize", sites: ARG0 },
    ReleaseSpec { function: "sqlite3_free", sites: ARG0 },
    ReleaseSpec { function: "sqlite3_backup_finish", sites: ARG0 },
    ReleaseSpec { function: "sqlite3_blob_close", sites: ARG0 },
    ReleaseSpec { function: "png_destroy_read_struct", sites: &[Arg(0), Arg(1), Arg(2)] },
    ReleaseSpec { function: "png_destroy_write_struct", sites: &[Arg(0), Arg(1)] },
    ReleaseSpec { function: "png_destroy_info_struct", sites: &[Arg(1)] },
    ReleaseSpec { function: "cJSON_Delete", sites: ARG0 },
    ReleaseSpec { function: "cJSON_free", sites: ARG0 },
    // Ownership moves into the container.
    ReleaseSpec { function: "cJSON_AddItemToObject", sites: &[Arg(2)] },
    ReleaseSpec { function: "cJSON_AddItemToArray", sites: &[Arg(1)] },
    ReleaseSpec { function: "cJSON_ReplaceItemInArray", sites: &[Arg(2)] },
    ReleaseSpec { function: "cJSON_ReplaceItemInObject", sites: &[Arg(2)] },
    ReleaseSpec { function: "cmsCloseProfile", sites: ARG0 },
    ReleaseSpec { function: "cmsDeleteTransform", sites: ARG0 },
    ReleaseSpec { function: "cmsIT8Free", sites: ARG0 },
    ReleaseSpec { function: "cmsFreeToneCurve", sites: ARG0 },
    ReleaseSpec { function: "cmsPipelineFree", sites: ARG0 },
    ReleaseSpec { function: "cmsMLUfree", sites: ARG0 },
    ReleaseSpec { function: "cmsDeleteContext", sites: ARG0 },
    ReleaseSpec { function: "pcap_close", sites: ARG0 },
    ReleaseSpec { function: "pcap_dump_close", sites: ARG0 },
    ReleaseSpec { function: "pcap_freecode", sites: ARG0 },
    ReleaseSpec { function: "pcap_freealldevs", sites: ARG0 },
    ReleaseSpec { function: "cre2_delete", sites: ARG0 },
    ReleaseSpec { function: "cre2_opt_delete", sites: ARG0 },
    ReleaseSpec { function: "cre2_set_delete", sites: ARG0 },
    ReleaseSpec { function: "UnityEnd", sites: &[Session("unity")] },
    ReleaseSpec { function: "free", sites: ARG0 },
    ReleaseSpec { function: "fclose", sites: ARG0 },
];

const TEMP_CREATORS: &[TempFileSpec] = &[
    TempFileSpec { function: "gzopen", path_arg: 0, mode_arg: Some(1) },
    TempFileSpec { function: "fopen", path_arg: 0, mode_arg: Some(1) },
    TempFileSpec { function: "sqlite3_open", path_arg: 0, mode_arg: None },
    TempFileSpec { function: "sqlite3_open_v2", path_arg: 0, mode_arg: None },
    TempFileSpec { function: "cmsSaveProfileToFile", path_arg: 1, mode_arg: None },
    TempFileSpec { function: "cmsIT8SaveToFile", path_arg: 1, mode_arg: None },
    TempFileSpec { function: "cmsOpenProfileFromFile", path_arg: 0, mode_arg: Some(1) },
    TempFileSpec { function: "pcap_dump_open", path_arg: 1, mode_arg: None },
];

const TEMP_REMOVERS: &[TempFileSpec] = &[
    TempFileSpec { function: "remove", path_arg: 0, mode_arg: None },
    TempFileSpec { function: "unlink", path_arg: 0, mode_arg: None },
];

const VOID_FUNCTIONS: &[&str] = &[
    "free",
    "cJSON_Delete",
    "cJSON_free",
    "png_destroy_read_struct",
    "png_destroy_write_struct",
    "png_destroy_info_struct",
    "png_set_compression_level",
    "png_set_sig_bytes",
    "pcap_close",
    "pcap_dump",
    "pcap_dump_close",
    "pcap_freecode",
    "pcap_freealldevs",
    "cre2_delete",
    "cre2_opt_delete",
    "cre2_set_delete",
    "cre2_opt_set_case_sensitive",
    "cre2_opt_set_log_errors",
    "cre2_opt_set_max_mem",
    "cmsIT8Free",
    "cmsFreeToneCurve",
    "cmsPipelineFree",
    "cmsMLUfree",
    "cmsDeleteTransform",
    "cmsDeleteContext",
    "cmsDoTransform",
    "sqlite3_free",
    "UnityBegin",
];

/// Functions that accept NULL in the given argument position as documented,
/// defined behaviour.
const NULL_SAFE: &[(&str, usize)] = &[
    ("gzclose", 0),
    ("deflateEnd", 0),
    ("inflateEnd", 0),
    ("deflate", 0),
    ("inflate", 0),
    ("deflateReset", 0),
    ("inflateReset", 0),
    ("deflateBound", 0),
    ("crc32", 1),
    ("adler32", 1),
    ("sqlite3_close", 0),
    ("sqlite3_close_v2", 0),
    ("sqlite3_finalize", 0),
    ("sqlite3_free", 0),
    ("sqlite3_reset", 0),
    ("sqlite3_errmsg", 0),
    ("png_destroy_read_struct", 0),
    ("png_destroy_write_struct", 0),
    ("png_get_io_ptr", 0),
    ("png_get_user_width_max", 0),
    ("png_set_compression_level", 0),
    ("png_get_compression_buffer_size", 0),
    ("cJSON_Delete", 0),
    ("cJSON_Parse", 0),
    ("cJSON_GetObjectItem", 0),
    ("cJSON_GetArraySize", 0),
    ("cJSON_IsObject", 0),
    ("cJSON_IsArray", 0),
    ("cJSON_PrintUnformatted", 0),
    ("cJSON_AddNumberToObject", 0),
    ("cJSON_AddStringToObject", 0),
    ("cJSON_free", 0),
    ("cmsCloseProfile", 0),
    ("cre2_delete", 0),
    ("cre2_opt_delete", 0),
    ("free", 0),
];

/// Functions whose length argument may be zero, with that argument's index.
const ZERO_LENGTH_SAFE: &[(&str, usize)] = &[
    ("gzwrite", 2),
    ("gzread", 2),
    ("crc32", 2),
    ("adler32", 2),
    ("deflateBound", 1),
    ("cJSON_ParseWithLength", 1),
    ("cmsDoTransform", 3),
    ("png_set_sig_bytes", 1),
];

/// Releases that null or invalidate their handle, so a second call is defined.
const DOUBLE_RELEASE_SAFE: &[&str] = &[
    "deflateEnd",
    "inflateEnd",
    "inflateBackEnd",
    "pcap_freecode",
    "png_destroy_read_struct",
    "png_destroy_write_struct",
    "png_destroy_info_struct",
];

/// Operations that detect a released handle instead of dereferencing it.
const USE_AFTER_RELEASE_SAFE: &[&str] = &[
    "deflate",
    "deflateBound",
    "deflateReset",
    "deflateParams",
    "inflate",
    "inflateReset",
    "png_get_io_ptr",
    "png_get_user_width_max",
    "png_set_compression_level",
    "png_get_compression_buffer_size",
];

/// Static knowledge about how the target libraries (and the libc helpers the
/// seeds lean on) open, close and create things.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceModel;

impl ResourceModel {
    pub fn new() -> Self {
        ResourceModel
    }

    pub fn acquire(&self, function: &str) -> Option<&'static AcquireSpec> {
        ACQUIRES.iter().find(|spec| spec.function == function)
    }

    pub fn release(&self, function: &str) -> Option<&'static ReleaseSpec> {
        RELEASES.iter().find(|spec| spec.function == function)
    }

    pub fn temp_creator(&self, function: &str) -> Option<&'static TempFileSpec> {
        TEMP_CREATORS.iter().find(|spec| spec.function == function)
    }

    pub fn temp_remover(&self, function: &str) -> Option<&'static TempFileSpec> {
        TEMP_REMOVERS.iter().find(|spec| spec.function == function)
    }

    pub fn returns_void(&self, function: &str) -> bool {
        VOID_FUNCTIONS.contains(&function)
    }

    /// Argument index that may be NULL for `function`, if any.
    pub fn null_safe_arg(&self, function: &str) -> Option<usize> {
        NULL_SAFE
            .iter()
            .find(|(name, _)| *name == function)
            .map(|(_, idx)| *idx)
    }

    /// Index of the length argument that may be zero for `function`, if any.
    pub fn zero_length_arg(&self, function: &str) -> Option<usize> {
        ZERO_LENGTH_SAFE
            .iter()
            .find(|(name, _)| *name == function)
            .map(|(_, idx)| *idx)
    }

    /// Whether the wrapped library documents `function` as well-defined for
    /// the given perturbation.
    pub fn edge_case_is_defined(&self, function: &str, kind: EdgeCaseKind) -> bool {
        match kind {
            EdgeCaseKind::NullArgument => self.null_safe_arg(function).is_some(),
            EdgeCaseKind::ZeroLength => self.zero_length_arg(function).is_some(),
            EdgeCaseKind::DoubleRelease => DOUBLE_RELEASE_SAFE.contains(&function),
            EdgeCaseKind::UseAfterRelease => USE_AFTER_RELEASE_SAFE.contains(&function),
            EdgeCaseKind::Unclassified => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_tokens_and_aliases_resolve() {
        for library in TargetLibrary::ALL {
            assert_eq!(library.token().parse::<TargetLibrary>(), Ok(library));
        }
        assert_eq!("sqlite3".parse::<TargetLibrary>(), Ok(TargetLibrary::Sqlite));
        assert_eq!("CJSON".parse::<TargetLibrary>(), Ok(TargetLibrary::CJson));
        assert_eq!("testframework".parse::<TargetLibrary>(), Ok(TargetLibrary::Unity));
        assert_eq!(
            "libfoo".parse::<TargetLibrary>(),
            Err(UnknownLibrary("libfoo".to_string()))
        );
    }

    #[test]
    fn function_name_follows_convention() {
        assert_eq!(TargetLibrary::Zlib.function_name(), "test_zlib_api_sequence");
        assert_eq!(TargetLibrary::CJson.function_name(), "test_cJSON_api_sequence");
    }

    #[test]
    fn resource_model_pairs_zlib_stream_calls() {
        let model = ResourceModel::new();
        let acquire = model.acquire("deflateInit_").expect("deflateInit_ acquires");
        assert_eq!(acquire.site, HandleSite::Arg(0));
        let release = model.release("deflateEnd").expect("deflateEnd releases");
        assert_eq!(release.sites, &[HandleSite::Arg(0)]);
        assert!(model.acquire("deflate").is_none());
    }

    #[test]
    fn edge_case_table_distinguishes_defined_from_undefined() {
        let model = ResourceModel::new();
        assert!(model.edge_case_is_defined("cJSON_Delete", EdgeCaseKind::NullArgument));
        assert!(!model.edge_case_is_defined("pcap_close", EdgeCaseKind::NullArgument));
        assert!(model.edge_case_is_defined("deflateEnd", EdgeCaseKind::DoubleRelease));
        assert!(!model.edge_case_is_defined("gzclose", EdgeCaseKind::DoubleRelease));
        assert_eq!(model.zero_length_arg("gzwrite"), Some(2));
        assert!(!model.edge_case_is_defined("gzwrite", EdgeCaseKind::Unclassified));
    }

    #[test]
    fn target_library_serde_uses_tokens() {
        let json = serde_json::to_string(&TargetLibrary::Libpcap).unwrap();
        assert_eq!(json, "\"libpcap\"");
        let parsed: TargetLibrary = serde_json::from_str("\"pcap\"").unwrap();
        assert_eq!(parsed, TargetLibrary::Libpcap);
    }
}
