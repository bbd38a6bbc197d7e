//! Static registry of module names the resolver is allowed to import.

/// Top-level standard library modules of CPython 3.11.
///
/// Names that are either side-effecting on import (`antigravity`, `this`) or
/// reserved for the interpreter's own test suite are left out.
pub const STDLIB_MODULES: &[&str] = &[
    "abc", "aifc", "argparse", "array", "ast", "asynchat", "asyncio", "asyncore", "atexit",
    "audioop", "base64", "bdb", "binascii", "bisect", "builtins", "bz2", "calendar", "cgi",
    "cgitb", "chunk", "cmath", "cmd", "code", "codecs", "codeop", "collections", "colorsys",
    "compileall", "concurrent", "configparser", "contextlib", "contextvars", "copy", "copyreg",
    "cProfile", "crypt", "csv", "ctypes", "curses", "dataclasses", "datetime", "dbm", "decimal",
    "difflib", "dis", "doctest", "email", "encodings", "ensurepip", "enum", "errno",
    "faulthandler", "fcntl", "filecmp", "fileinput", "fnmatch", "fractions", "ftplib",
    "functools", "gc", "getopt", "getpass", "gettext", "glob", "graphlib", "grp", "gzip",
    "hashlib", "heapq", "hmac", "html", "http", "imaplib", "imghdr", "importlib", "inspect",
    "io", "ipaddress", "itertools", "json", "keyword", "linecache", "locale", "logging", "lzma",
    "mailbox", "mailcap", "marshal", "math", "mimetypes", "mmap", "modulefinder",
    "multiprocessing", "netrc", "numbers", "operator", "optparse", "os", "pathlib", "pdb",
    "pickle", "pickletools", "pipes", "pkgutil", "platform", "plistlib", "poplib", "posix",
    "pprint", "profile", "pstats", "pty", "pwd", "py_compile", "pyclbr", "pydoc", "queue",
    "quopri", "random", "re", "readline", "reprlib", "resource", "rlcompleter", "runpy", "sched",
    "secrets", "select", "selectors", "shelve", "shlex", "shutil", "signal", "site", "smtplib",
    "sndhdr", "socket", "socketserver", "sqlite3", "ssl", "stat", "statistics", "string",
    "stringprep", "struct", "subprocess", "sunau", "symtable", "sys", "sysconfig", "syslog",
    "tabnanny", "tarfile", "telnetlib", "tempfile", "termios", "textwrap", "threading", "time",
    "timeit", "tkinter", "token", "tokenize", "tomllib", "trace", "traceback", "tracemalloc",
    "tty", "turtle", "types", "typing", "unicodedata", "unittest", "urllib", "uu", "uuid",
    "venv", "warnings", "wave", "weakref", "webbrowser", "wsgiref", "xdrlib", "xml", "xmlrpc",
    "zipapp", "zipfile", "zipimport", "zlib", "zoneinfo",
];

/// Third-party modules generated code commonly reaches for.
pub const CURATED_MODULES: &[&str] = &[
    "attr", "bs4", "click", "cv2", "dateutil", "fastapi", "flask", "httpx", "jinja2", "lxml",
    "matplotlib", "networkx", "numpy", "pandas", "PIL", "pydantic", "pytz", "requests",
    "scipy", "seaborn", "sklearn", "statsmodels", "sympy", "toml", "torch", "tqdm", "yaml",
];

/// Conventional short names: `(binding, module)`.
pub const ALIASES: &[(&str, &str)] = &[
    ("np", "numpy"),
    ("pd", "pandas"),
    ("plt", "matplotlib.pyplot"),
    ("sns", "seaborn"),
    ("nx", "networkx"),
    ("sm", "statsmodels.api"),
];

/// Import name to pip distribution name where the two differ.
pub const PIP_NAMES: &[(&str, &str)] = &[
    ("attr", "attrs"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python-headless"),
    ("dateutil", "python-dateutil"),
    ("PIL", "pillow"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
];

/// How a missing name gets bound: `import module` or `import module as binding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    pub module: String,
    pub binding: String,
}

impl ImportSpec {
    pub fn statement(&self) -> String {
        if self.module == self.binding {
            format!("import {}", self.module)
        } else {
            format!("import {} as {}", self.module, self.binding)
        }
    }

    /// Top-level package, which is what a dependency manifest needs.
    pub fn top_level(&self) -> &str {
        self.module.split('.').next().unwrap_or(&self.module)
    }
}

/// Lookup over the static tables above.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownModules;

impl KnownModules {
    pub fn is_stdlib(&self, name: &str) -> bool {
        STDLIB_MODULES.contains(&name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Resolves a bare name found in code to the import that would bind it.
    pub fn resolve(&self, name: &str) -> Option<ImportSpec> {
        if STDLIB_MODULES.contains(&name) || CURATED_MODULES.contains(&name) {
            return Some(ImportSpec {
                module: name.to_string(),
                binding: name.to_string(),
            });
        }
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(alias, module)| ImportSpec {
                module: module.to_string(),
                binding: alias.to_string(),
            })
    }

    pub fn pip_name<'a>(&self, module: &'a str) -> &'a str {
        PIP_NAMES
            .iter()
            .find(|(import, _)| *import == module)
            .map(|(_, pip)| *pip)
            .unwrap_or(module)
    }
}
