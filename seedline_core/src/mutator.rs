use crate::corpus::Corpus;
use crate::generator::SeedGenerator;
use crate::library::{EdgeCaseKind, ResourceModel, TargetLibrary};
use crate::seed::{
    self, Binding, EdgeCaseTag, LibraryCall, Quality, SeedMetadata, SeedRecord, Statement,
    TempPath,
};
use crate::validate::contains_id_token;
use anyhow::anyhow;
use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::trace;

/// A `Mutator` turns a seed into a new seed.
///
/// Mutators are the second half of seed production: the generator writes
/// valid sequences from scratch, mutators derive variants from seeds already
/// in the corpus.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    /// Applies a mutation strategy to an optional seed to produce a new seed.
    ///
    /// # Arguments
    /// * `input_opt`: The seed to derive from. With `None` the mutator may
    ///   produce a seed from scratch.
    /// * `rng`: A mutable reference to a random number generator.
    /// * `corpus_opt`: The current corpus, for mutators that draw on other
    ///   seeds. Optional.
    ///
    /// # Returns
    /// The new seed, or an error if no mutation applies.
    fn mutate(
        &mut self,
        input_opt: Option<&SeedRecord>,
        rng: &mut R,
        corpus_opt: Option<&dyn Corpus>,
    ) -> Result<SeedRecord, anyhow::Error>;
}

/// One place in a seed body where a perturbed call can go.
#[derive(Debug, Clone)]
struct Insertion {
    /// Top-level statement index the new call follows.
    after: usize,
    call: LibraryCall,
}

/// Inserts one deliberately perturbed call into a copy of a valid seed.
///
/// The perturbations are those the library documents as defined: a NULL
/// argument where NULL is accepted, a zero length, a second release of a
/// handle the release nulls out, and a use of a handle right after its
/// release where the library detects it. With `allow_undefined` the mutator
/// also emits undefined perturbations, tagged `deliberate_ub`.
///
/// The mutant gets a fresh ID from the generator's allocator, and every temp
/// file it writes is renamed into the new ID's namespace.
#[derive(Debug, Clone)]
pub struct EdgeCaseMutator {
    generator: SeedGenerator,
    fallback_library: TargetLibrary,
    allow_undefined: bool,
    model: ResourceModel,
}

impl EdgeCaseMutator {
    pub fn new(generator: SeedGenerator, fallback_library: TargetLibrary) -> Self {
        Self {
            generator,
            fallback_library,
            allow_undefined: false,
            model: ResourceModel::new(),
        }
    }

    pub fn allow_undefined(mut self, allow: bool) -> Self {
        self.allow_undefined = allow;
        self
    }

    fn candidates(&self, body: &[Statement]) -> Vec<Insertion> {
        let mut out = Vec::new();
        for (idx, stmt) in body.iter().enumerate() {
            let Statement::Call(call) = stmt else {
                continue;
            };
            let name = call.function_name.as_str();
            if call.edge_case.is_some()
                || self.model.acquire(name).is_some()
                || self.model.temp_creator(name).is_some()
                || self.model.temp_remover(name).is_some()
            {
                continue;
            }

            if let Some(arg) = self.model.null_safe_arg(name) {
                if let Some(perturbed) = self.replace_arg(call, arg, "NULL") {
                    out.push(self.tagged(idx, perturbed, EdgeCaseKind::NullArgument, false));
                }
            } else if self.allow_undefined {
                if let Some(perturbed) = self.replace_arg(call, 0, "NULL") {
                    out.push(self.tagged(idx, perturbed, EdgeCaseKind::NullArgument, true));
                }
            }

            if let Some(arg) = self.model.zero_length_arg(name) {
                if let Some(perturbed) = self.replace_arg(call, arg, "0") {
                    out.push(self.tagged(idx, perturbed, EdgeCaseKind::ZeroLength, false));
                }
            }

            if self.model.release(name).is_some() {
                let defined = self
                    .model
                    .edge_case_is_defined(name, EdgeCaseKind::DoubleRelease);
                if defined || self.allow_undefined {
                    out.push(self.tagged(idx, call.clone(), EdgeCaseKind::DoubleRelease, !defined));
                }
                out.extend(self.uses_after_release(body, idx, call));
            }
        }
        out
    }

    /// Copies of earlier operations on the handles `release` closes, placed
    /// right after it.
    fn uses_after_release(
        &self,
        body: &[Statement],
        release_idx: usize,
        release: &LibraryCall,
    ) -> Vec<Insertion> {
        let released: Vec<String> = release
            .arguments
            .iter()
            .filter_map(|arg| seed::handle_name(arg))
            .collect();
        let mut out = Vec::new();
        for stmt in &body[..release_idx] {
            let Statement::Call(call) = stmt else {
                continue;
            };
            let name = call.function_name.as_str();
            if call.edge_case.is_some()
                || self.model.acquire(name).is_some()
                || self.model.release(name).is_some()
            {
                continue;
            }
            let touches = call
                .arguments
                .iter()
                .filter_map(|arg| seed::handle_name(arg))
                .any(|handle| released.contains(&handle));
            if !touches {
                continue;
            }
            let defined = self
                .model
                .edge_case_is_defined(name, EdgeCaseKind::UseAfterRelease);
            if defined || self.allow_undefined {
                out.push(self.tagged(
                    release_idx,
                    call.clone(),
                    EdgeCaseKind::UseAfterRelease,
                    !defined,
                ));
            }
        }
        out
    }

    fn replace_arg(&self, call: &LibraryCall, idx: usize, value: &str) -> Option<LibraryCall> {
        let current = call.arguments.get(idx)?.trim();
        let unchanged = match value {
            "NULL" => seed::is_null_literal(current),
            _ => current == value,
        };
        if unchanged {
            return None;
        }
        let mut perturbed = call.clone();
        perturbed.arguments[idx] = value.to_string();
        Some(perturbed)
    }

    fn tagged(
        &self,
        after: usize,
        mut call: LibraryCall,
        kind: EdgeCaseKind,
        deliberate_ub: bool,
    ) -> Insertion {
        // The copy never keeps a result; assigning would clobber the original binding.
        if matches!(call.binding, Binding::Assigned { .. }) || call.binding == Binding::Bare {
            call = if self.model.returns_void(&call.function_name) {
                call.void()
            } else {
                call.discarded()
            };
        }
        Insertion {
            after,
            call: call.with_edge_case(EdgeCaseTag::new(kind, deliberate_ub)),
        }
    }

    fn apply(&self, seed: &SeedRecord, insertion: Insertion) -> SeedRecord {
        let new_id = self.generator.ids().next_id();
        let mut body = seed.body().to_vec();
        body.insert(insertion.after + 1, Statement::Call(insertion.call));

        for path in seed.temp_files(&self.model) {
            if let TempPath::Literal(old) = path {
                let renamed = renamespace(&old, seed.id(), new_id);
                rename_literal(&mut body, &format!("\"{old}\""), &format!("\"{renamed}\""));
            }
        }

        let draft = seed.rebuild(
            SeedMetadata {
                id: new_id,
                ..Default::default()
            },
            body,
        );
        let metadata = SeedMetadata {
            id: new_id,
            prompt: seed.metadata().prompt.clone(),
            combination: seed.metadata().combination.clone(),
            score: 0.0,
            unique_branch_count: 0,
            quality: Some(Quality {
                library_calls: draft.call_identifiers().into_iter().collect(),
                ..Default::default()
            }),
        };
        draft.rebuild(metadata, draft.body().to_vec())
    }
}

impl<R: Rng + ?Sized> Mutator<R> for EdgeCaseMutator {
    fn mutate(
        &mut self,
        input_opt: Option<&SeedRecord>,
        rng: &mut R,
        _corpus_opt: Option<&dyn Corpus>,
    ) -> Result<SeedRecord, anyhow::Error> {
        let Some(seed) = input_opt else {
            return Ok(self.generator.generate(self.fallback_library, rng)?);
        };
        let candidates = self.candidates(seed.body());
        let insertion = candidates
            .choose(rng)
            .cloned()
            .ok_or_else(|| anyhow!("seed {} has no call an edge case applies to", seed.id()))?;
        trace!(
            seed_id = seed.id(),
            function = %insertion.call.function_name,
            "inserting edge-case call"
        );
        Ok(self.apply(seed, insertion))
    }
}

/// Moves a temp-file name into `new_id`'s namespace. Names that carry the old
/// ID have it swapped; anything else gets a `seedline_<new_id>_` prefix on its
/// file-name component.
pub fn renamespace(path: &str, old_id: u64, new_id: u64) -> String {
    if contains_id_token(path, old_id) {
        let needle = old_id.to_string();
        let bytes = path.as_bytes();
        let mut out = String::with_capacity(path.len());
        let mut last = 0;
        for (start, _) in path.match_indices(&needle) {
            let end = start + needle.len();
            let before = start.checked_sub(1).and_then(|i| bytes.get(i));
            let after = bytes.get(end);
            if before.is_some_and(u8::is_ascii_digit) || after.is_some_and(u8::is_ascii_digit) {
                continue;
            }
            out.push_str(&path[last..start]);
            out.push_str(&new_id.to_string());
            last = end;
        }
        out.push_str(&path[last..]);
        return out;
    }
    match path.rfind('/') {
        Some(slash) => format!("{}seedline_{new_id}_{}", &path[..=slash], &path[slash + 1..]),
        None => format!("seedline_{new_id}_{path}"),
    }
}

fn rename_literal(body: &mut [Statement], from: &str, to: &str) {
    let swap = |text: &mut String| {
        if text.contains(from) {
            *text = text.replace(from, to);
        }
    };
    for stmt in body {
        match stmt {
            Statement::Call(call) => call.arguments.iter_mut().for_each(swap),
            Statement::Raw(text) => swap(text),
            Statement::Guard {
                condition,
                condition_calls,
                then_body,
                else_body,
            } => {
                swap(condition);
                for call in condition_calls {
                    call.arguments.iter_mut().for_each(swap);
                }
                rename_literal(then_body, from, to);
                rename_literal(else_body, from, to);
            }
            Statement::Loop {
                header,
                trailer,
                condition_calls,
                body,
            } => {
                swap(header);
                if let Some(trailer) = trailer {
                    swap(trailer);
                }
                for call in condition_calls {
                    call.arguments.iter_mut().for_each(swap);
                }
                rename_literal(body, from, to);
            }
            Statement::Comment(_) | Statement::Return(_) => {}
        }
    }
}
