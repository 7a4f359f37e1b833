//! Built-in transformers: template rendering and repo-name rewriting.

use minijinja::Environment;

use super::{TransformContext, TransformError, Transformer};

/// Renders file content as a minijinja template.
///
/// The configured variables are exposed directly, alongside a few built-ins:
/// `source_repo`, `target_repo`, `target_name` (repo without owner), and
/// `file_path`. Only valid UTF-8 is templated; anything else is an error the
/// batch processor converts into a fall-back to the original bytes.
#[derive(Debug, Default)]
pub struct TemplateTransformer;

impl Transformer for TemplateTransformer {
    fn name(&self) -> &str {
        "template"
    }

    fn transform(&self, input: &[u8], ctx: &TransformContext) -> Result<Vec<u8>, TransformError> {
        let text = std::str::from_utf8(input).map_err(|e| TransformError {
            transformer: self.name().to_string(),
            message: format!("{}: not valid UTF-8: {e}", ctx.file_path),
        })?;

        let mut env = Environment::new();
        // Files routinely contain `{{` sequences meant for other tools
        // (GitHub Actions, Helm); keep undefined variables as-is rather than
        // failing the render.
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Chainable);
        env.add_template("file", text).map_err(|e| TransformError {
            transformer: self.name().to_string(),
            message: format!("{}: {e}", ctx.file_path),
        })?;

        let mut vars = ctx.variables.clone();
        vars.insert("source_repo".to_string(), ctx.source_repo.clone());
        vars.insert("target_repo".to_string(), ctx.target_repo.clone());
        vars.insert(
            "target_name".to_string(),
            ctx.target_repo
                .rsplit('/')
                .next()
                .unwrap_or(&ctx.target_repo)
                .to_string(),
        );
        vars.insert("file_path".to_string(), ctx.file_path.clone());

        let rendered = env
            .get_template("file")
            .and_then(|tmpl| tmpl.render(&vars))
            .map_err(|e| TransformError {
                transformer: self.name().to_string(),
                message: format!("{}: {e}", ctx.file_path),
            })?;

        Ok(rendered.into_bytes())
    }
}

/// Rewrites occurrences of the source repo slug to the target repo slug.
///
/// Keeps badges, module paths, and clone URLs pointing at the repo that
/// received the file instead of the template repo it came from.
#[derive(Debug, Default)]
pub struct RepoNameTransformer;

impl Transformer for RepoNameTransformer {
    fn name(&self) -> &str {
        "repo-name"
    }

    fn transform(&self, input: &[u8], ctx: &TransformContext) -> Result<Vec<u8>, TransformError> {
        if ctx.source_repo.is_empty() || ctx.source_repo == ctx.target_repo {
            return Ok(input.to_vec());
        }

        let text = match std::str::from_utf8(input) {
            Ok(text) => text,
            // Not text; nothing to rewrite.
            Err(_) => return Ok(input.to_vec()),
        };

        Ok(text
            .replace(&ctx.source_repo, &ctx.target_repo)
            .into_bytes())
    }
}
