//! Layout of the work directory and the on-disk node store.
use anyhow::Context;
use ptfuzz_core::{
    corpus::{CorpusNode, CoverageMaps, Finding, NodeKind, NodeStore},
    method::{FuzzMethod, MethodKind, Yields},
};
use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    fs::{self, create_dir_all, read_dir, remove_dir_all, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Instant,
};

/// Paths of everything written below the work directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory tree, wiping old content first if `purge` is set.
    pub fn init(&self, purge: bool) -> anyhow::Result<()> {
        if purge && self.root.exists() {
            log::info!("purging {}", self.root.display());
            for sub in &[
                "corpus",
                "findings",
                "preliminary",
                "yield",
                "bitmaps",
                "evaluation",
                "rbuf",
            ] {
                let p = self.root.join(sub);
                if p.exists() {
                    remove_dir_all(&p).with_context(|| format!("failed to remove {}", p.display()))?;
                }
            }
            let y = self.yield_txt();
            if y.exists() {
                fs::remove_file(&y).with_context(|| format!("failed to remove {}", y.display()))?;
            }
        }
        let mut dirs = vec![
            self.root.join("corpus"),
            self.root.join("preliminary"),
            self.root.join("findings").join("non_uniq"),
            self.root.join("yield").join("corpus"),
            self.root.join("yield").join("preliminary"),
            self.root.join("bitmaps"),
            self.root.join("evaluation"),
            self.rbuf_dir(),
            self.imports_dir(),
        ];
        for f in Finding::ALL.iter() {
            dirs.push(self.root.join("findings").join(f.name()));
        }
        for d in dirs {
            create_dir_all(&d).with_context(|| format!("failed to create {}", d.display()))?;
        }
        Ok(())
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Payload file of a node.
    pub fn node_path(&self, node: &CorpusNode) -> PathBuf {
        match node.kind {
            NodeKind::Regular | NodeKind::Favorite => self.corpus_path(node.id),
            NodeKind::Finding(f) => self
                .root
                .join("findings")
                .join(f.name())
                .join(format!("{}_{:05}", f.name(), node.id)),
            NodeKind::Preliminary => self.preliminary_path(node.id),
        }
    }

    pub fn corpus_path(&self, id: u64) -> PathBuf {
        self.root.join("corpus").join(format!("payload_{:05}", id))
    }

    pub fn preliminary_path(&self, id: u64) -> PathBuf {
        self.root
            .join("preliminary")
            .join(format!("preliminary_{:05}", id))
    }

    pub fn yield_path(&self, id: u64, preliminary: bool) -> PathBuf {
        let sub = if preliminary { "preliminary" } else { "corpus" };
        self.root
            .join("yield")
            .join(sub)
            .join(format!("yield-{}", id))
    }

    pub fn yield_txt(&self) -> PathBuf {
        self.root.join("yield.txt")
    }

    pub fn findings_csv(&self) -> PathBuf {
        self.root.join("evaluation").join("findings.csv")
    }

    pub fn non_uniq_path(&self, f: Finding, n: u64) -> PathBuf {
        self.root
            .join("findings")
            .join("non_uniq")
            .join(format!("{}_non_uniq_{}", f.name(), n))
    }

    pub fn rbuf_dir(&self) -> PathBuf {
        self.root.join("rbuf")
    }

    pub fn rbuf_path(&self, f: Finding, n: u64) -> PathBuf {
        self.rbuf_dir().join(format!("{}_{}.rbuf", f.name(), n))
    }

    pub fn imports_dir(&self) -> PathBuf {
        self.root.join("imports")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join("stats.json")
    }

    /// Preliminary payloads with their ids, ordered by id.
    pub fn preliminary_files(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for e in read_dir(self.root.join("preliminary"))?.filter_map(|e| e.ok()) {
            let name = e.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix("preliminary_"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(id) = id {
                files.push((id, e.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Files dropped into `imports/` by external tools.
    pub fn import_files(&self) -> io::Result<Vec<PathBuf>> {
        list_files(&self.imports_dir())
    }

    /// Payloads of regular and favorite nodes.
    pub fn corpus_files(&self) -> io::Result<Vec<PathBuf>> {
        list_files(&self.root.join("corpus"))
    }

    /// Mutation record of a node, `Unknown` if the record is missing or broken.
    pub fn read_method(&self, id: u64, preliminary: bool) -> FuzzMethod {
        let p = self.yield_path(id, preliminary);
        match fs::read(&p) {
            Ok(content) => match serde_json::from_slice::<YieldRecord>(&content) {
                Ok(r) => r.into_method(),
                Err(e) => {
                    log::warn!("bad yield record {}: {}", p.display(), e);
                    FuzzMethod::default()
                }
            },
            Err(_) => FuzzMethod::default(),
        }
    }

    /// Append one `[elapsed_secs, path]` line to `findings.csv`.
    pub fn log_finding(&self, elapsed: f64, path: &Path) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.findings_csv())?;
        let line = serde_json::to_string(&(elapsed, path.display().to_string()))?;
        writeln!(f, "{}", line)
    }
}

/// Mutation record stored next to every corpus and preliminary payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct YieldRecord {
    pub method: String,
    pub redqueen_cmp: Vec<String>,
    pub input_byte: Vec<usize>,
    pub level: usize,
    pub payload_len: usize,
    /// Hex sha-1 of the payload.
    pub sha1: String,
}

impl YieldRecord {
    pub fn new(node: &CorpusNode, payload: &[u8]) -> Self {
        Self {
            method: node.method.kind.name().to_string(),
            redqueen_cmp: node.method.redqueen_cmp.clone(),
            input_byte: node.method.input_byte.clone(),
            level: node.level,
            payload_len: payload.len(),
            sha1: hex::encode(Sha1::digest(payload)),
        }
    }

    pub fn into_method(self) -> FuzzMethod {
        FuzzMethod {
            kind: MethodKind::from_name(&self.method).unwrap_or_default(),
            redqueen_cmp: self.redqueen_cmp,
            input_byte: self.input_byte,
        }
    }
}

/// [`NodeStore`] writing payloads below a [`WorkDir`].
pub struct DiskStore {
    dir: WorkDir,
    start: Instant,
}

impl DiskStore {
    pub fn new(dir: WorkDir) -> Self {
        Self {
            dir,
            start: Instant::now(),
        }
    }

    pub fn workdir(&self) -> &WorkDir {
        &self.dir
    }

    fn write_record(&self, node: &CorpusNode, payload: &[u8]) -> io::Result<()> {
        let preliminary = match node.kind {
            NodeKind::Regular | NodeKind::Favorite => false,
            NodeKind::Preliminary => true,
            NodeKind::Finding(_) => return Ok(()),
        };
        let record = YieldRecord::new(node, payload);
        let content = serde_json::to_vec(&record)?;
        fs::write(self.dir.yield_path(node.id, preliminary), content)
    }
}

impl NodeStore for DiskStore {
    fn save_node(&mut self, node: &CorpusNode, payload: &[u8]) -> io::Result<()> {
        let path = self.dir.node_path(node);
        fs::write(&path, payload)?;
        self.write_record(node, payload)?;
        if node.kind.is_finding() {
            self.dir
                .log_finding(self.start.elapsed().as_secs_f64(), &path)?;
        }
        Ok(())
    }

    fn remove_node(&mut self, node: &CorpusNode) -> io::Result<()> {
        let path = self.dir.node_path(node);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        if node.kind == NodeKind::Preliminary {
            let y = self.dir.yield_path(node.id, true);
            if y.exists() {
                fs::remove_file(y)?;
            }
        }
        Ok(())
    }

    fn load_payload(&self, node: &CorpusNode) -> io::Result<Vec<u8>> {
        fs::read(self.dir.node_path(node))
    }

    fn save_yields(&mut self, yields: &Yields) -> io::Result<()> {
        fs::write(self.dir.yield_txt(), yields.report())
    }

    fn save_bitmaps(&mut self, maps: &CoverageMaps) -> io::Result<()> {
        let dir = self.dir.root().join("bitmaps");
        fs::write(dir.join("coverage"), &maps.coverage)?;
        for f in Finding::ALL.iter() {
            fs::write(dir.join(f.name()), maps.finding(*f))?;
        }
        Ok(())
    }
}

fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<_> = read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Read every regular file of `dir`, ordered by name. Empty files are skipped.
pub fn read_seeds(dir: &Path) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut paths: Vec<_> = read_dir(dir)
        .with_context(|| format!("failed to read_dir: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    let mut seeds = Vec::with_capacity(paths.len());
    for p in paths {
        let content = fs::read(&p).with_context(|| format!("failed to read seed {}", p.display()))?;
        if content.is_empty() {
            log::warn!("empty seed ignored: {}", p.display());
            continue;
        }
        seeds.push(content);
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptfuzz_core::{
        corpus::{CoverageTree, TreeConfig},
        RngType,
    };
    use rand::SeedableRng;

    fn tmp_workdir(name: &str) -> WorkDir {
        let root = std::env::temp_dir().join(format!("ptfuzz-{}-{}", name, std::process::id()));
        let _ = remove_dir_all(&root);
        let wd = WorkDir::new(root);
        wd.init(false).unwrap();
        wd
    }

    fn trace(size: usize, hits: &[usize]) -> Vec<u8> {
        let mut t = vec![0; size];
        for &h in hits {
            t[h] = 1;
        }
        t
    }

    #[test]
    fn store_layout() {
        let wd = tmp_workdir("store");
        let config = TreeConfig {
            bitmap_size: 256,
            depth_first: false,
        };
        let seeds = vec![(b"seed".to_vec(), trace(256, &[1]))];
        let mut tree = CoverageTree::new(
            DiskStore::new(wd.clone()),
            config,
            RngType::from_entropy(),
            seeds,
        )
        .unwrap();
        assert_eq!(fs::read(wd.corpus_path(1)).unwrap(), b"seed");

        let m = FuzzMethod {
            kind: MethodKind::Havoc,
            redqueen_cmp: vec!["4000".to_string()],
            input_byte: vec![3],
        };
        let r = tree
            .append(b"seed2", &trace(256, &[1, 2]), m.clone(), None, 0.001)
            .unwrap();
        assert!(r.accepted);
        assert_eq!(fs::read(wd.corpus_path(2)).unwrap(), b"seed2");
        assert_eq!(wd.read_method(2, false), m);
        assert!(fs::read_to_string(wd.yield_txt()).unwrap().contains("havoc"));

        let r = tree
            .append(b"boom", &trace(256, &[5]), FuzzMethod::default(), Some(Finding::Crash), 0.0)
            .unwrap();
        assert!(r.accepted);
        let crash = wd.root().join("findings").join("crash").join("crash_00001");
        assert_eq!(fs::read(&crash).unwrap(), b"boom");
        let csv = fs::read_to_string(wd.findings_csv()).unwrap();
        assert!(csv.contains("crash_00001"));

        remove_dir_all(wd.root()).unwrap();
    }

    #[test]
    fn preliminary_files_removed_on_enable() {
        let wd = tmp_workdir("prelim");
        let config = TreeConfig {
            bitmap_size: 64,
            depth_first: true,
        };
        let seeds = vec![(b"a".to_vec(), trace(64, &[0]))];
        let mut tree =
            CoverageTree::new(DiskStore::new(wd.clone()), config, RngType::from_entropy(), seeds).unwrap();
        tree.toggle_preliminary_mode(true).unwrap();
        tree.append(b"b", &trace(64, &[0, 9]), MethodKind::Bitflip8.into(), None, 0.0)
            .unwrap();
        assert_eq!(tree.toggle_preliminary_mode(false).unwrap(), 1);
        let files = wd.preliminary_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, 1);
        assert_eq!(wd.read_method(1, true).kind, MethodKind::Bitflip8);

        tree.toggle_preliminary_mode(true).unwrap();
        assert!(wd.preliminary_files().unwrap().is_empty());
        remove_dir_all(wd.root()).unwrap();
    }
}
