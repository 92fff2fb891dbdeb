//! JetBrains remote backends: one installer over a product table.

use std::env;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use crate::workspace::IdeConfig;

use super::download_and_unpack;

/// Download metadata for one JetBrains product. Products differ only in
/// data; the install flow is shared.
pub struct Product {
    pub name: &'static str,
    /// Directory on download.jetbrains.com.
    pub dir: &'static str,
    /// Archive prefix, also used as the install directory name.
    pub archive: &'static str,
    pub default_version: &'static str,
}

pub const GOLAND: Product = Product {
    name: "GoLand",
    dir: "go",
    archive: "goland",
    default_version: "2024.2.3",
};

pub const RUSTROVER: Product = Product {
    name: "RustRover",
    dir: "rustrover",
    archive: "RustRover",
    default_version: "2024.2",
};

pub const PYCHARM: Product = Product {
    name: "PyCharm",
    dir: "python",
    archive: "pycharm-professional",
    default_version: "2024.2.3",
};

pub const PHPSTORM: Product = Product {
    name: "PhpStorm",
    dir: "webide",
    archive: "PhpStorm",
    default_version: "2024.2.2",
};

pub const INTELLIJ: Product = Product {
    name: "IntelliJ IDEA",
    dir: "idea",
    archive: "ideaIU",
    default_version: "2024.2.3",
};

pub const CLION: Product = Product {
    name: "CLion",
    dir: "cpp",
    archive: "CLion",
    default_version: "2024.2.2",
};

pub const RIDER: Product = Product {
    name: "Rider",
    dir: "rider",
    archive: "JetBrains.Rider",
    default_version: "2024.2.5",
};

pub const RUBYMINE: Product = Product {
    name: "RubyMine",
    dir: "ruby",
    archive: "RubyMine",
    default_version: "2024.2.2",
};

pub const WEBSTORM: Product = Product {
    name: "WebStorm",
    dir: "webstorm",
    archive: "WebStorm",
    default_version: "2024.2.2",
};

pub const DATASPELL: Product = Product {
    name: "DataSpell",
    dir: "python",
    archive: "dataspell",
    default_version: "2024.2.1",
};

impl Product {
    pub fn download_url(&self, version: &str) -> String {
        let arch = if env::consts::ARCH == "aarch64" {
            "-aarch64"
        } else {
            ""
        };
        format!(
            "https://download.jetbrains.com/{}/{}-{}{}.tar.gz",
            self.dir, self.archive, version, arch
        )
    }
}

pub fn setup(ide: &IdeConfig, product: &Product, home: &Path) -> Result<()> {
    let target = home
        .join(".cache/JetBrains/RemoteDev/dist")
        .join(product.archive);
    if target.exists() {
        debug!(product = product.name, "backend already installed");
        return Ok(());
    }

    let version = ide.option("VERSION").unwrap_or(product.default_version);
    download_and_unpack(&product.download_url(version), &target)?;
    info!(product = product.name, version, "installed jetbrains backend");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_download_url_format() {
        let url = GOLAND.download_url("2024.2.3");
        if env::consts::ARCH == "aarch64" {
            assert_eq!(
                url,
                "https://download.jetbrains.com/go/goland-2024.2.3-aarch64.tar.gz"
            );
        } else {
            assert_eq!(
                url,
                "https://download.jetbrains.com/go/goland-2024.2.3.tar.gz"
            );
        }
    }

    #[test]
    fn test_setup_skips_when_already_installed() {
        let td = tempfile::tempdir().unwrap();
        let target = td
            .path()
            .join(".cache/JetBrains/RemoteDev/dist")
            .join("goland");
        fs::create_dir_all(&target).unwrap();
        // a download attempt would fail loudly in the test environment
        setup(&IdeConfig::default(), &GOLAND, td.path()).unwrap();
    }
}
