//! Builds well-formed seeds from a catalog of per-library recipes.
//!
//! A recipe is one resource (or one stateless group of calls) with its
//! declarations, acquire step, operations and release. The generator picks a
//! few recipes, orders their acquires by prerequisite, guards each acquire
//! with a cleanup-and-return block, and tears everything down in reverse.

use crate::library::{ResourceModel, TargetLibrary};
use crate::parse::{self, ParseError};
use crate::seed::{self, Bindings, Quality, SeedMetadata, SeedRecord, Statement, TempPath};
use crate::sentinel::{SUCCESS_SENTINEL, SeedOutcome};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("No recipes are available for {0}")]
    NoRecipes(TargetLibrary),

    #[error("{library} has no recipe named '{name}'")]
    UnknownRecipe {
        library: TargetLibrary,
        name: String,
    },

    #[error("Recipe '{recipe}' names unknown prerequisite '{prerequisite}'")]
    UnknownPrerequisite {
        recipe: &'static str,
        prerequisite: &'static str,
    },

    #[error("Recipe '{recipe}' template does not parse: {source}")]
    Template {
        recipe: &'static str,
        #[source]
        source: ParseError,
    },
}

/// Scratch file a recipe writes, named `seedline_<id>_<recipe>.<extension>`.
#[derive(Debug, Clone, Copy)]
pub struct TempFileTemplate {
    /// `const char *` variable the path is bound to.
    pub variable: &'static str,
    pub extension: &'static str,
}

/// An acquire call and the condition under which it failed.
#[derive(Debug, Clone, Copy)]
pub struct AcquireTemplate {
    pub statement: &'static str,
    pub failed_when: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct Recipe {
    pub name: &'static str,
    pub library: TargetLibrary,
    pub includes: &'static [&'static str],
    /// Top-level code the recipe needs ahead of the sequence function.
    pub prelude: &'static str,
    pub declarations: &'static [&'static str],
    pub acquire: Option<AcquireTemplate>,
    pub operations: &'static [&'static str],
    pub release: Option<&'static str>,
    pub temp_file: Option<TempFileTemplate>,
    pub requires: &'static [&'static str],
}

const NONE: &[&str] = &[];

const fn recipe(name: &'static str, library: TargetLibrary) -> Recipe {
    Recipe {
        name,
        library,
        includes: NONE,
        prelude: "",
        declarations: NONE,
        acquire: None,
        operations: NONE,
        release: None,
        temp_file: None,
        requires: NONE,
    }
}

const fn acquire(statement: &'static str, failed_when: &'static str) -> Option<AcquireTemplate> {
    Some(AcquireTemplate {
        statement,
        failed_when: Some(failed_when),
    })
}

const fn temp(variable: &'static str, extension: &'static str) -> Option<TempFileTemplate> {
    Some(TempFileTemplate {
        variable,
        extension,
    })
}

use TargetLibrary::{CJson, Lcms, Libpcap, Libpng, Re2, Sqlite, Unity, Zlib};

const ZLIB_H: &[&str] = &["<zlib.h>", "<string.h>", "<stdio.h>"];
const SQLITE_H: &[&str] = &["<sqlite3.h>", "<string.h>", "<stdio.h>"];
const PNG_H: &[&str] = &["<png.h>"];
const CJSON_H: &[&str] = &["<cjson/cJSON.h>", "<string.h>"];
const LCMS_H: &[&str] = &["<lcms2.h>", "<stdio.h>"];
const PCAP_H: &[&str] = &["<pcap/pcap.h>", "<string.h>", "<stdio.h>"];
const RE2_H: &[&str] = &["<cre2.h>", "<string.h>"];
const UNITY_H: &[&str] = &["\"unity.h\""];

pub const RECIPES: &[Recipe] = &[
    // zlib
    Recipe {
        includes: ZLIB_H,
        declarations: &[
            "z_stream def_strm;",
            "memset(&def_strm, 0, sizeof(def_strm));",
            "unsigned char def_in[] = \"seedline deflate input seedline deflate input\";",
            "unsigned char def_out[256];",
        ],
        acquire: acquire(
            "int def_rc = deflateInit_(&def_strm, Z_DEFAULT_COMPRESSION, ZLIB_VERSION, (int)sizeof(z_stream));",
            "def_rc != Z_OK",
        ),
        operations: &[
            "def_strm.next_in = def_in;",
            "def_strm.avail_in = (uInt)sizeof(def_in);",
            "def_strm.next_out = def_out;",
            "def_strm.avail_out = (uInt)sizeof(def_out);",
            "(void)deflate(&def_strm, Z_FINISH);",
            "(void)deflateBound(&def_strm, (uLong)sizeof(def_in));",
        ],
        release: Some("(void)deflateEnd(&def_strm);"),
        ..recipe("deflate_stream", Zlib)
    },
    Recipe {
        includes: ZLIB_H,
        declarations: &[
            "z_stream inf_strm;",
            "memset(&inf_strm, 0, sizeof(inf_strm));",
            "unsigned char inf_out[128];",
        ],
        acquire: acquire(
            "int inf_rc = inflateInit_(&inf_strm, ZLIB_VERSION, (int)sizeof(z_stream));",
            "inf_rc != Z_OK",
        ),
        operations: &[
            "inf_strm.next_out = inf_out;",
            "inf_strm.avail_out = (uInt)sizeof(inf_out);",
            "(void)inflate(&inf_strm, Z_NO_FLUSH);",
            "(void)inflateReset(&inf_strm);",
        ],
        release: Some("(void)inflateEnd(&inf_strm);"),
        ..recipe("inflate_stream", Zlib)
    },
    Recipe {
        includes: ZLIB_H,
        declarations: &[
            "const char *gz_path = \"{file}\";",
            "const char gz_text[] = \"seedline gz payload\";",
        ],
        acquire: acquire("gzFile gz_out = gzopen(gz_path, \"wb\");", "gz_out == NULL"),
        operations: &[
            "(void)gzwrite(gz_out, gz_text, (unsigned)strlen(gz_text));",
            "(void)gzputs(gz_out, \"seedline\");",
            "(void)gzflush(gz_out, Z_SYNC_FLUSH);",
        ],
        release: Some("(void)gzclose(gz_out);"),
        temp_file: temp("gz_path", "gz"),
        ..recipe("gz_file", Zlib)
    },
    Recipe {
        includes: ZLIB_H,
        declarations: &["const char ck_data[] = \"seedline checksum\";"],
        operations: &[
            "uLong ck_crc = crc32(0L, Z_NULL, 0);",
            "ck_crc = crc32(ck_crc, (const Bytef *)ck_data, (uInt)strlen(ck_data));",
            "uLong ck_adler = adler32(1L, (const Bytef *)ck_data, (uInt)strlen(ck_data));",
            "(void)ck_crc;",
            "(void)ck_adler;",
        ],
        ..recipe("checksums", Zlib)
    },
    Recipe {
        includes: ZLIB_H,
        declarations: &[
            "Bytef cb_dest[512];",
            "uLongf cb_dest_len = (uLongf)sizeof(cb_dest);",
            "const char cb_src[] = \"seedline compress seedline compress\";",
        ],
        operations: &[
            "(void)compress(cb_dest, &cb_dest_len, (const Bytef *)cb_src, (uLong)strlen(cb_src));",
            "(void)compressBound((uLong)strlen(cb_src));",
        ],
        ..recipe("compress_buffer", Zlib)
    },
    // SQLite
    Recipe {
        includes: SQLITE_H,
        declarations: &[
            "sqlite3 *db = NULL;",
            "char *db_err = NULL;",
            "const char *db_path = \"{file}\";",
        ],
        acquire: acquire("int db_rc = sqlite3_open(db_path, &db);", "db_rc != SQLITE_OK"),
        operations: &[
            "(void)sqlite3_exec(db, \"CREATE TABLE t(a INTEGER, b TEXT);\", NULL, NULL, &db_err);",
            "sqlite3_free(db_err);",
            "(void)sqlite3_exec(db, \"INSERT INTO t VALUES(1, 'seedline');\", NULL, NULL, &db_err);",
            "sqlite3_free(db_err);",
            "(void)sqlite3_last_insert_rowid(db);",
            "(void)sqlite3_changes(db);",
        ],
        release: Some("(void)sqlite3_close(db);"),
        temp_file: temp("db_path", "db"),
        ..recipe("database", Sqlite)
    },
    Recipe {
        includes: SQLITE_H,
        declarations: &["sqlite3_stmt *stmt = NULL;"],
        acquire: acquire(
            "int stmt_rc = sqlite3_prepare_v2(db, \"SELECT 1, 'seedline';\", -1, &stmt, NULL);",
            "stmt_rc != SQLITE_OK",
        ),
        operations: &[
            "while (sqlite3_step(stmt) == SQLITE_ROW) {\n    (void)sqlite3_column_int(stmt, 0);\n    (void)sqlite3_column_text(stmt, 1);\n}",
            "(void)sqlite3_reset(stmt);",
        ],
        release: Some("(void)sqlite3_finalize(stmt);"),
        requires: &["database"],
        ..recipe("statement", Sqlite)
    },
    Recipe {
        includes: SQLITE_H,
        acquire: acquire(
            "char *mp_sql = sqlite3_mprintf(\"SELECT %d;\", 42);",
            "mp_sql == NULL",
        ),
        operations: &["(void)strlen(mp_sql);"],
        release: Some("sqlite3_free(mp_sql);"),
        ..recipe("formatted_sql", Sqlite)
    },
    Recipe {
        includes: SQLITE_H,
        operations: &[
            "(void)sqlite3_libversion_number();",
            "(void)sqlite3_threadsafe();",
            "(void)sqlite3_complete(\"SELECT 1;\");",
        ],
        ..recipe("library_info", Sqlite)
    },
    // libpng
    Recipe {
        includes: PNG_H,
        acquire: acquire(
            "png_structp png_w = png_create_write_struct(PNG_LIBPNG_VER_STRING, NULL, NULL, NULL);",
            "png_w == NULL",
        ),
        operations: &[
            "png_set_compression_level(png_w, 6);",
            "(void)png_get_io_ptr(png_w);",
            "(void)png_get_compression_buffer_size(png_w);",
        ],
        release: Some("png_destroy_write_struct(&png_w, NULL);"),
        ..recipe("write_struct", Libpng)
    },
    Recipe {
        includes: PNG_H,
        acquire: acquire("png_infop png_info = png_create_info_struct(png_w);", "png_info == NULL"),
        operations: &["(void)png_get_image_width(png_w, png_info);"],
        release: Some("png_destroy_info_struct(png_w, &png_info);"),
        requires: &["write_struct"],
        ..recipe("info_struct", Libpng)
    },
    Recipe {
        includes: PNG_H,
        acquire: acquire(
            "png_structp png_r = png_create_read_struct(PNG_LIBPNG_VER_STRING, NULL, NULL, NULL);",
            "png_r == NULL",
        ),
        operations: &[
            "png_set_sig_bytes(png_r, 8);",
            "(void)png_get_user_width_max(png_r);",
        ],
        release: Some("png_destroy_read_struct(&png_r, NULL, NULL);"),
        ..recipe("read_struct", Libpng)
    },
    Recipe {
        includes: PNG_H,
        operations: &[
            "(void)png_access_version_number();",
            "(void)png_sig_cmp((png_const_bytep)\"\\x89PNG\\r\\n\\x1a\\n\", 0, 8);",
        ],
        ..recipe("version_info", Libpng)
    },
    // cJSON
    Recipe {
        includes: CJSON_H,
        declarations: &[
            "const char *doc_text = \"{\\\"name\\\":\\\"seedline\\\",\\\"values\\\":[1,2,3]}\";",
        ],
        acquire: acquire("cJSON *doc = cJSON_Parse(doc_text);", "doc == NULL"),
        operations: &[
            "(void)cJSON_GetObjectItem(doc, \"name\");",
            "(void)cJSON_GetArraySize(cJSON_GetObjectItem(doc, \"values\"));",
            "(void)cJSON_IsObject(doc);",
        ],
        release: Some("cJSON_Delete(doc);"),
        ..recipe("parsed_document", CJson)
    },
    Recipe {
        includes: CJSON_H,
        acquire: acquire("cJSON *obj = cJSON_CreateObject();", "obj == NULL"),
        operations: &[
            "(void)cJSON_AddNumberToObject(obj, \"n\", 42);",
            "(void)cJSON_AddStringToObject(obj, \"s\", \"seedline\");",
        ],
        release: Some("cJSON_Delete(obj);"),
        ..recipe("built_object", CJson)
    },
    Recipe {
        includes: CJSON_H,
        acquire: acquire("char *printed = cJSON_PrintUnformatted(obj);", "printed == NULL"),
        operations: &["(void)strlen(printed);"],
        release: Some("cJSON_free(printed);"),
        requires: &["built_object"],
        ..recipe("printed_object", CJson)
    },
    // Little CMS
    Recipe {
        includes: LCMS_H,
        acquire: acquire("cmsHPROFILE srgb = cmsCreate_sRGBProfile();", "srgb == NULL"),
        operations: &[
            "(void)cmsGetColorSpace(srgb);",
            "(void)cmsGetEncodedICCversion(srgb);",
        ],
        release: Some("(void)cmsCloseProfile(srgb);"),
        ..recipe("srgb_profile", Lcms)
    },
    Recipe {
        includes: LCMS_H,
        acquire: acquire("cmsHPROFILE lab = cmsCreateLab4Profile(NULL);", "lab == NULL"),
        operations: &["(void)cmsGetPCS(lab);"],
        release: Some("(void)cmsCloseProfile(lab);"),
        ..recipe("lab_profile", Lcms)
    },
    Recipe {
        includes: LCMS_H,
        declarations: &["unsigned char xf_rgb[3] = {255, 128, 0};", "cmsCIELab xf_lab;"],
        acquire: acquire(
            "cmsHTRANSFORM xform = cmsCreateTransform(srgb, TYPE_RGB_8, lab, TYPE_Lab_DBL, INTENT_PERCEPTUAL, 0);",
            "xform == NULL",
        ),
        operations: &["cmsDoTransform(xform, xf_rgb, &xf_lab, 1);"],
        release: Some("cmsDeleteTransform(xform);"),
        requires: &["srgb_profile", "lab_profile"],
        ..recipe("transform", Lcms)
    },
    Recipe {
        includes: LCMS_H,
        declarations: &["const char *it8_path = \"{file}\";"],
        acquire: acquire("cmsHANDLE it8 = cmsIT8Alloc(NULL);", "it8 == NULL"),
        operations: &[
            "(void)cmsIT8SetPropertyStr(it8, \"ORIGINATOR\", \"seedline\");",
            "(void)cmsIT8SaveToFile(it8, it8_path);",
        ],
        release: Some("cmsIT8Free(it8);"),
        temp_file: temp("it8_path", "it8"),
        ..recipe("it8_sheet", Lcms)
    },
    Recipe {
        includes: LCMS_H,
        acquire: acquire("cmsToneCurve *curve = cmsBuildGamma(NULL, 2.2);", "curve == NULL"),
        operations: &[
            "(void)cmsEvalToneCurveFloat(curve, 0.5f);",
            "(void)cmsIsToneCurveLinear(curve);",
        ],
        release: Some("cmsFreeToneCurve(curve);"),
        ..recipe("tone_curve", Lcms)
    },
    // libpcap. Live capture blocks and needs privileges, so only dead handles.
    Recipe {
        includes: PCAP_H,
        acquire: acquire(
            "pcap_t *pcap_dead = pcap_open_dead(DLT_EN10MB, 65535);",
            "pcap_dead == NULL",
        ),
        operations: &[
            "(void)pcap_datalink(pcap_dead);",
            "(void)pcap_snapshot(pcap_dead);",
        ],
        release: Some("pcap_close(pcap_dead);"),
        ..recipe("dead_handle", Libpcap)
    },
    Recipe {
        includes: PCAP_H,
        declarations: &["struct bpf_program pcap_prog;"],
        acquire: acquire(
            "int prog_rc = pcap_compile(pcap_dead, &pcap_prog, \"tcp port 80\", 1, PCAP_NETMASK_UNKNOWN);",
            "prog_rc != 0",
        ),
        operations: &["(void)pcap_geterr(pcap_dead);"],
        release: Some("pcap_freecode(&pcap_prog);"),
        requires: &["dead_handle"],
        ..recipe("filter_program", Libpcap)
    },
    Recipe {
        includes: PCAP_H,
        declarations: &[
            "const char *dump_path = \"{file}\";",
            "struct pcap_pkthdr dump_hdr;",
            "u_char dump_pkt[64];",
            "memset(&dump_hdr, 0, sizeof(dump_hdr));",
            "memset(dump_pkt, 0, sizeof(dump_pkt));",
            "dump_hdr.caplen = (bpf_u_int32)sizeof(dump_pkt);",
            "dump_hdr.len = (bpf_u_int32)sizeof(dump_pkt);",
        ],
        acquire: acquire(
            "pcap_dumper_t *dumper = pcap_dump_open(pcap_dead, dump_path);",
            "dumper == NULL",
        ),
        operations: &[
            "pcap_dump((u_char *)dumper, &dump_hdr, dump_pkt);",
            "(void)pcap_dump_flush(dumper);",
        ],
        release: Some("pcap_dump_close(dumper);"),
        temp_file: temp("dump_path", "pcap"),
        requires: &["dead_handle"],
        ..recipe("dump_file", Libpcap)
    },
    // RE2 through the cre2 C binding
    Recipe {
        includes: RE2_H,
        declarations: &["const char *re_pattern = \"(se+d)line\";", "cre2_string_t re_match[2];"],
        acquire: acquire(
            "cre2_regexp_t *re = cre2_new(re_pattern, (int)strlen(re_pattern), NULL);",
            "re == NULL",
        ),
        operations: &[
            "(void)cre2_error_code(re);",
            "(void)cre2_num_capturing_groups(re);",
            "(void)cre2_match(re, \"seedline\", 8, 0, 8, CRE2_UNANCHORED, re_match, 2);",
        ],
        release: Some("cre2_delete(re);"),
        ..recipe("compiled_regex", Re2)
    },
    Recipe {
        includes: RE2_H,
        acquire: acquire("cre2_options_t *re_opt = cre2_opt_new();", "re_opt == NULL"),
        operations: &[
            "cre2_opt_set_case_sensitive(re_opt, 0);",
            "cre2_opt_set_log_errors(re_opt, 0);",
        ],
        release: Some("cre2_opt_delete(re_opt);"),
        ..recipe("regex_options", Re2)
    },
    // Unity
    Recipe {
        includes: UNITY_H,
        prelude: "void setUp(void) {}\nvoid tearDown(void) {}",
        acquire: Some(AcquireTemplate {
            statement: "UnityBegin(\"seedline_unity.c\");",
            failed_when: None,
        }),
        operations: &["UnityPrint(\"seedline\");"],
        release: Some("(void)UnityEnd();"),
        ..recipe("session", Unity)
    },
    Recipe {
        includes: UNITY_H,
        operations: &["UnityPrintNumber((UNITY_INT)66);"],
        requires: &["session"],
        ..recipe("number_output", Unity)
    },
];

pub fn recipes_for(library: TargetLibrary) -> Vec<&'static Recipe> {
    RECIPES.iter().filter(|r| r.library == library).collect()
}

fn find_recipe(library: TargetLibrary, name: &str) -> Option<&'static Recipe> {
    RECIPES
        .iter()
        .find(|r| r.library == library && r.name == name)
}

/// Hands out seed IDs. Clones share one counter, so every seed a process
/// generates or mutates gets a distinct ID.
#[derive(Debug, Clone)]
pub struct SeedIds {
    next: Arc<AtomicU64>,
}

impl SeedIds {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Ensures later IDs stay above `id`.
    pub fn observe(&self, id: u64) {
        self.next.fetch_max(id.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for SeedIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Namespaced scratch-file name for one recipe of one seed.
pub fn temp_file_name(seed_id: u64, recipe: &str, extension: &str) -> String {
    format!("seedline_{seed_id}_{recipe}.{extension}")
}

#[derive(Debug, Clone)]
pub struct SeedGenerator {
    ids: SeedIds,
    max_recipes: usize,
    model: ResourceModel,
}

impl SeedGenerator {
    pub fn new(ids: SeedIds, max_recipes: usize) -> Self {
        Self {
            ids,
            max_recipes: max_recipes.max(1),
            model: ResourceModel::new(),
        }
    }

    pub fn ids(&self) -> &SeedIds {
        &self.ids
    }

    /// Picks between one and `max_recipes` recipes for `library` and builds a
    /// seed from them and their prerequisites.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        library: TargetLibrary,
        rng: &mut R,
    ) -> Result<SeedRecord, GenerateError> {
        let mut catalog = recipes_for(library);
        if catalog.is_empty() {
            return Err(GenerateError::NoRecipes(library));
        }
        catalog.shuffle(rng);
        let count = rng.random_range(1..=self.max_recipes.min(catalog.len()));
        let chosen = with_prerequisites(library, &catalog[..count])?;
        self.build(library, self.ids.next_id(), &chosen)
    }

    /// Builds the seed for an explicit recipe list (prerequisites are added).
    pub fn generate_from(
        &self,
        library: TargetLibrary,
        recipe_names: &[&str],
    ) -> Result<SeedRecord, GenerateError> {
        let mut picked = Vec::new();
        for name in recipe_names {
            let recipe = find_recipe(library, name).ok_or_else(|| GenerateError::UnknownRecipe {
                library,
                name: name.to_string(),
            })?;
            picked.push(recipe);
        }
        let chosen = with_prerequisites(library, &picked)?;
        self.build(library, self.ids.next_id(), &chosen)
    }

    fn build(
        &self,
        library: TargetLibrary,
        id: u64,
        recipes: &[&Recipe],
    ) -> Result<SeedRecord, GenerateError> {
        let mut includes: Vec<String> = Vec::new();
        let mut preludes: Vec<&str> = Vec::new();
        for &recipe in recipes {
            for include in recipe.includes {
                if !includes.iter().any(|i| i == include) {
                    includes.push(include.to_string());
                }
            }
            if !recipe.prelude.is_empty() && !preludes.contains(&recipe.prelude) {
                preludes.push(recipe.prelude);
            }
        }

        let fill = |recipe: &Recipe, template: &str| -> String {
            match recipe.temp_file {
                Some(file) => template.replace(
                    "{file}",
                    &temp_file_name(id, recipe.name, file.extension),
                ),
                None => template.to_string(),
            }
        };
        let statements = |recipe: &Recipe, template: &str| {
            parse::parse_statements(&fill(recipe, template)).map_err(|source| {
                GenerateError::Template {
                    recipe: recipe.name,
                    source,
                }
            })
        };

        let mut body = Vec::new();
        for &recipe in recipes {
            for declaration in recipe.declarations {
                body.extend(statements(recipe, declaration)?);
            }
        }
        let bindings = Bindings::collect(&body);

        // Acquires, each guarded by cleanup of everything before it.
        let mut acquired: Vec<&Recipe> = Vec::new();
        let mut created: Vec<String> = Vec::new();
        let mut step = 0;
        for &recipe in recipes {
            let Some(acquire) = recipe.acquire else {
                continue;
            };
            let acquire_body = statements(recipe, acquire.statement)?;
            let mut held_on_failure = false;
            let mut creates_file = false;
            for call in seed::all_calls(&acquire_body) {
                if let Some(spec) = self.model.acquire(&call.function_name) {
                    held_on_failure |= spec.held_on_failure();
                }
                if matches!(
                    seed::created_path(call, &self.model, &bindings),
                    Some(TempPath::Literal(_))
                ) {
                    creates_file = true;
                }
            }
            body.extend(acquire_body);
            if creates_file {
                if let Some(file) = recipe.temp_file {
                    created.push(file.variable.to_string());
                }
            }

            if let Some(condition) = acquire.failed_when {
                step += 1;
                let mut cleanup = Vec::new();
                if held_on_failure {
                    if let Some(release) = recipe.release {
                        cleanup.extend(statements(recipe, release)?);
                    }
                }
                for &previous in acquired.iter().rev() {
                    if let Some(release) = previous.release {
                        cleanup.extend(statements(previous, release)?);
                    }
                }
                for variable in created.iter().rev() {
                    cleanup.extend(removal(variable));
                }
                cleanup.push(Statement::returning(
                    SeedOutcome::setup_failed(step).return_value(),
                ));
                body.push(Statement::Guard {
                    condition: fill(recipe, condition),
                    condition_calls: Vec::new(),
                    then_body: cleanup,
                    else_body: Vec::new(),
                });
            }
            acquired.push(recipe);
        }

        for &recipe in recipes {
            for operation in recipe.operations {
                body.extend(statements(recipe, operation)?);
            }
        }
        for &recipe in recipes.iter().rev() {
            if let Some(release) = recipe.release {
                body.extend(statements(recipe, release)?);
            }
        }
        for recipe in recipes {
            if let Some(file) = recipe.temp_file {
                body.extend(removal(file.variable));
            }
        }
        body.push(Statement::returning(SUCCESS_SENTINEL));
        parse::apply_void_discards(&mut body);

        let draft = SeedRecord::assemble(
            SeedMetadata {
                id,
                ..Default::default()
            },
            library,
            includes,
            body,
        )
        .with_prelude(preludes.join("\n"));
        let metadata = SeedMetadata {
            id,
            prompt: String::new(),
            combination: recipes.iter().map(|r| r.name.to_string()).collect(),
            score: 0.0,
            unique_branch_count: 0,
            quality: Some(Quality {
                library_calls: draft.call_identifiers().into_iter().collect(),
                ..Default::default()
            }),
        };
        let record = draft.rebuild(metadata, draft.body().to_vec());
        trace!(seed_id = id, library = %library, recipes = recipes.len(), "generated seed");
        Ok(record)
    }
}

fn removal(variable: &str) -> Vec<Statement> {
    vec![Statement::Call(
        seed::LibraryCall::new("remove", &[variable]).discarded(),
    )]
}

/// Adds prerequisites ahead of the recipes that need them, without
/// duplicates.
fn with_prerequisites(
    library: TargetLibrary,
    picked: &[&'static Recipe],
) -> Result<Vec<&'static Recipe>, GenerateError> {
    fn visit(
        library: TargetLibrary,
        recipe: &'static Recipe,
        seen: &mut BTreeSet<&'static str>,
        out: &mut Vec<&'static Recipe>,
    ) -> Result<(), GenerateError> {
        if !seen.insert(recipe.name) {
            return Ok(());
        }
        for name in recipe.requires {
            let prerequisite =
                find_recipe(library, name).ok_or(GenerateError::UnknownPrerequisite {
                    recipe: recipe.name,
                    prerequisite: name,
                })?;
            visit(library, prerequisite, seen, out)?;
        }
        out.push(recipe);
        Ok(())
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for recipe in picked {
        visit(library, recipe, &mut seen, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::validate;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn every_recipe_template_parses() {
        let generator = SeedGenerator::new(SeedIds::default(), 8);
        for recipe in RECIPES {
            let seed = generator
                .generate_from(recipe.library, &[recipe.name])
                .unwrap_or_else(|e| panic!("{}: {e}", recipe.name));
            assert!(seed.metadata().combination.iter().any(|c| c == recipe.name));
        }
    }

    #[test]
    fn every_single_recipe_seed_is_well_formed() {
        let generator = SeedGenerator::new(SeedIds::default(), 8);
        let model = ResourceModel::new();
        for recipe in RECIPES {
            let seed = generator.generate_from(recipe.library, &[recipe.name]).unwrap();
            let report = validate(&seed, &model);
            assert!(
                report.is_well_formed(),
                "{} produced {:?}\n{}",
                recipe.name,
                report.violations,
                seed.source()
            );
        }
    }

    #[test]
    fn prerequisites_come_first() {
        let generator = SeedGenerator::new(SeedIds::starting_at(30), 4);
        let seed = generator.generate_from(Sqlite, &["statement"]).unwrap();
        assert_eq!(seed.metadata().combination, vec!["database", "statement"]);
        assert_eq!(seed.id(), 30);
        let sequence = seed.call_sequence();
        let open = sequence.iter().position(|c| c == "sqlite3_open").unwrap();
        let prepare = sequence.iter().position(|c| c == "sqlite3_prepare_v2").unwrap();
        let finalize = sequence.iter().rposition(|c| c == "sqlite3_finalize").unwrap();
        let close = sequence.iter().rposition(|c| c == "sqlite3_close").unwrap();
        assert!(open < prepare && prepare < finalize && finalize < close);
    }

    #[test]
    fn held_connection_is_closed_on_failed_open() {
        let generator = SeedGenerator::new(SeedIds::starting_at(5), 4);
        let seed = generator.generate_from(Sqlite, &["database"]).unwrap();
        let text = seed.source();
        assert!(text.contains("const char *db_path = \"seedline_5_database.db\";"));
        assert!(text.contains(
            "    if (db_rc != SQLITE_OK) {\n        (void)sqlite3_close(db);\n        (void)remove(db_path);\n        return -1;\n    }\n"
        ));
        assert!(text.trim_end().ends_with("return 66;\n}"));
    }

    #[test]
    fn guards_release_earlier_acquires_in_reverse() {
        let generator = SeedGenerator::new(SeedIds::starting_at(8), 4);
        let seed = generator.generate_from(Lcms, &["transform"]).unwrap();
        let text = seed.source();
        assert!(text.contains(
            "    if (xform == NULL) {\n        (void)cmsCloseProfile(lab);\n        (void)cmsCloseProfile(srgb);\n        return -3;\n    }\n"
        ));
    }

    #[test]
    fn quality_lists_every_called_identifier() {
        let generator = SeedGenerator::new(SeedIds::default(), 4);
        let seed = generator.generate_from(Zlib, &["gz_file", "checksums"]).unwrap();
        let quality = seed.metadata().quality.as_ref().unwrap();
        for name in seed.call_identifiers() {
            assert!(quality.library_calls.contains(&name), "missing {name}");
        }
        assert!(quality.library_calls.contains(&"strlen".to_string()));
    }

    #[test]
    fn ids_are_shared_between_clones() {
        let ids = SeedIds::starting_at(10);
        let other = ids.clone();
        assert_eq!(ids.next_id(), 10);
        assert_eq!(other.next_id(), 11);
        other.observe(40);
        assert_eq!(ids.next_id(), 41);
    }

    proptest! {
        #[test]
        fn random_seeds_are_well_formed(seed in any::<u64>(), lib in 0usize..TargetLibrary::ALL.len()) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let generator = SeedGenerator::new(SeedIds::default(), 4);
            let library = TargetLibrary::ALL[lib];
            let record = generator.generate(library, &mut rng).unwrap();
            let report = validate(&record, &ResourceModel::new());
            prop_assert!(report.is_well_formed(), "{:?}\n{}", report.violations, record.source());
            let reparsed = crate::parse::parse_seed(record.source()).unwrap();
            prop_assert_eq!(reparsed.call_sequence(), record.call_sequence());
        }
    }
}
