//! Project classification and the manifest scaffold generator.
//!
//! A bundle carrying `manifest.yaml` (or `.yml`) describes entities and
//! fields; the generator synthesizes a runnable Node project from it.
//! User-provided paths always win over generated ones.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use liftoff_state::RuntimeKind;

/// One file in an uploaded (or generated) project bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectFile {
    pub path: String,
    pub contents: Vec<u8>,
}

impl ProjectFile {
    pub fn new(path: &str, contents: &str) -> Self {
        Self {
            path: path.to_string(),
            contents: contents.as_bytes().to_vec(),
        }
    }
}

/// Manifest parsing/generation failures.
#[derive(Debug, Error)]
pub enum ScaffoldError {
    #[error("unparseable manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("manifest declares no entities")]
    NoEntities,

    #[error("entity {0} declares no fields")]
    EmptyEntity(String),
}

/// Declarative project description.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    pub entities: Vec<ManifestEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntity {
    pub name: String,
    pub fields: Vec<ManifestField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
}

/// Classify a bundle by the presence of a manifest file.
pub fn classify_runtime(files: &[ProjectFile]) -> RuntimeKind {
    let has_manifest = files
        .iter()
        .any(|f| f.path == "manifest.yaml" || f.path == "manifest.yml");
    if has_manifest {
        RuntimeKind::ManifestGenerated
    } else {
        RuntimeKind::GenericNode
    }
}

/// Parse the manifest out of a bundle.
pub fn parse_manifest(files: &[ProjectFile]) -> Result<Manifest, ScaffoldError> {
    let raw = files
        .iter()
        .find(|f| f.path == "manifest.yaml" || f.path == "manifest.yml")
        .map(|f| f.contents.as_slice())
        .unwrap_or_default();
    let manifest: Manifest = serde_yaml::from_slice(raw)?;
    if manifest.entities.is_empty() {
        return Err(ScaffoldError::NoEntities);
    }
    for entity in &manifest.entities {
        if entity.fields.is_empty() {
            return Err(ScaffoldError::EmptyEntity(entity.name.clone()));
        }
    }
    Ok(manifest)
}

/// Generate the project scaffold for a manifest.
pub fn generate(manifest: &Manifest) -> Vec<ProjectFile> {
    let name = manifest.name.clone().unwrap_or_else(|| "app".to_string());
    vec![
        package_json(&name),
        index_js(manifest),
        database_js(manifest),
        readme(&name, manifest),
    ]
}

/// Overlay generated files with the user's bundle; user paths win.
pub fn merge_files(user: Vec<ProjectFile>, generated: Vec<ProjectFile>) -> Vec<ProjectFile> {
    let mut by_path: HashMap<String, ProjectFile> = HashMap::new();
    for file in generated {
        by_path.insert(file.path.clone(), file);
    }
    for file in user {
        by_path.insert(file.path.clone(), file);
    }
    let mut files: Vec<ProjectFile> = by_path.into_values().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

fn package_json(name: &str) -> ProjectFile {
    let contents = format!(
        r#"{{
  "name": "{name}",
  "version": "1.0.0",
  "main": "index.js",
  "scripts": {{
    "start": "node index.js"
  }}
}}
"#
    );
    ProjectFile::new("package.json", &contents)
}

fn index_js(manifest: &Manifest) -> ProjectFile {
    let mut routes = String::new();
    for entity in &manifest.entities {
        let collection = entity.name.to_lowercase();
        routes.push_str(&format!(
            r#"  if (url.pathname === '/{collection}') {{
    if (req.method === 'GET') return json(res, db.list('{collection}'));
    if (req.method === 'POST') return body(req).then((data) => json(res, db.insert('{collection}', data), 201));
  }}
"#
        ));
    }

    let contents = format!(
        r#"const http = require('http');
const db = require('./database');

const port = process.env.PORT || 3000;

function json(res, data, status = 200) {{
  res.writeHead(status, {{ 'content-type': 'application/json' }});
  res.end(JSON.stringify(data));
}}

function body(req) {{
  return new Promise((resolve) => {{
    let raw = '';
    req.on('data', (chunk) => (raw += chunk));
    req.on('end', () => resolve(raw ? JSON.parse(raw) : {{}}));
  }});
}}

const server = http.createServer((req, res) => {{
  const url = new URL(req.url, `http://${{req.headers.host}}`);
{routes}  if (url.pathname === '/health') return json(res, {{ ok: true }});
  json(res, {{ error: 'not found' }}, 404);
}});

server.listen(port, () => console.log(`listening on ${{port}}`));
"#
    );
    ProjectFile::new("index.js", &contents)
}

fn database_js(manifest: &Manifest) -> ProjectFile {
    let mut collections = String::new();
    for entity in &manifest.entities {
        collections.push_str(&format!("  {}: [],\n", entity.name.to_lowercase()));
    }
    let mut required_checks = String::new();
    for entity in &manifest.entities {
        let required: Vec<&str> = entity
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        if !required.is_empty() {
            required_checks.push_str(&format!(
                "  {}: [{}],\n",
                entity.name.to_lowercase(),
                required
                    .iter()
                    .map(|f| format!("'{f}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
    }

    let contents = format!(
        r#"const collections = {{
{collections}}};

const required = {{
{required_checks}}};

let nextId = 1;

module.exports = {{
  list(name) {{
    return collections[name] || [];
  }},
  insert(name, data) {{
    for (const field of required[name] || []) {{
      if (data[field] === undefined) throw new Error(`missing required field: ${{field}}`);
    }}
    const record = {{ id: nextId++, ...data }};
    collections[name].push(record);
    return record;
  }},
}};
"#
    );
    ProjectFile::new("database.js", &contents)
}

fn readme(name: &str, manifest: &Manifest) -> ProjectFile {
    let mut entities = String::new();
    for entity in &manifest.entities {
        entities.push_str(&format!(
            "- `{}` ({} fields), served at `/{}`\n",
            entity.name,
            entity.fields.len(),
            entity.name.to_lowercase()
        ));
    }
    let contents = format!(
        "# {name}\n\nGenerated from `manifest.yaml`.\n\n## Entities\n\n{entities}"
    );
    ProjectFile::new("README.md", &contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: blog
entities:
  - name: Post
    fields:
      - name: title
        type: text
        required: true
      - name: body
        type: longtext
"#;

    #[test]
    fn bundles_with_manifest_are_manifest_generated() {
        let files = vec![ProjectFile::new("manifest.yaml", MANIFEST)];
        assert_eq!(classify_runtime(&files), RuntimeKind::ManifestGenerated);

        let files = vec![ProjectFile::new("manifest.yml", MANIFEST)];
        assert_eq!(classify_runtime(&files), RuntimeKind::ManifestGenerated);

        let files = vec![
            ProjectFile::new("index.js", "console.log(1)"),
            ProjectFile::new("package.json", "{}"),
        ];
        assert_eq!(classify_runtime(&files), RuntimeKind::GenericNode);
    }

    #[test]
    fn manifest_parses_fields_and_required() {
        let files = vec![ProjectFile::new("manifest.yaml", MANIFEST)];
        let manifest = parse_manifest(&files).unwrap();
        assert_eq!(manifest.name.as_deref(), Some("blog"));
        assert_eq!(manifest.entities.len(), 1);
        let post = &manifest.entities[0];
        assert_eq!(post.name, "Post");
        assert!(post.fields[0].required);
        assert!(!post.fields[1].required);
        assert_eq!(post.fields[1].kind, "longtext");
    }

    #[test]
    fn empty_manifest_is_rejected() {
        let files = vec![ProjectFile::new("manifest.yaml", "entities: []")];
        assert!(matches!(
            parse_manifest(&files),
            Err(ScaffoldError::NoEntities)
        ));

        let files = vec![ProjectFile::new(
            "manifest.yaml",
            "entities:\n  - name: Post\n    fields: []",
        )];
        assert!(matches!(
            parse_manifest(&files),
            Err(ScaffoldError::EmptyEntity(_))
        ));
    }

    #[test]
    fn generator_produces_the_standard_four_files() {
        let files = vec![ProjectFile::new("manifest.yaml", MANIFEST)];
        let manifest = parse_manifest(&files).unwrap();
        let generated = generate(&manifest);

        let paths: Vec<&str> = generated.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["package.json", "index.js", "database.js", "README.md"]
        );

        let index = String::from_utf8(generated[1].contents.clone()).unwrap();
        assert!(index.contains("'/post'"));
        let db = String::from_utf8(generated[2].contents.clone()).unwrap();
        assert!(db.contains("'title'"));
    }

    #[test]
    fn user_files_win_on_merge() {
        let user = vec![
            ProjectFile::new("manifest.yaml", MANIFEST),
            ProjectFile::new("README.md", "my own readme"),
        ];
        let manifest = parse_manifest(&user).unwrap();
        let merged = merge_files(user, generate(&manifest));

        let readme = merged.iter().find(|f| f.path == "README.md").unwrap();
        assert_eq!(readme.contents, b"my own readme");
        assert!(merged.iter().any(|f| f.path == "index.js"));
        assert!(merged.iter().any(|f| f.path == "manifest.yaml"));
    }
}
