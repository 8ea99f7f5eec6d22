use rquickjs::Ctx;

/// Installs the core web-api classes (§6.3 category 1) a worker's `fetch`
/// handler expects to find in scope: `Headers`, `URL`, `URLSearchParams`,
/// `Request`, and `Response`. Deliberately minimal — no redirect following,
/// no streaming bodies — just enough surface for a handler to construct and
/// read these objects the way the fetch wrapper `Engine::compile_handlers`
/// emits expects.
const SOURCE: &str = r#"
(function () {
    class Headers {
        constructor(init) {
            this._map = new Map();
            if (init instanceof Headers) {
                for (const [k, v] of init.entries()) this.append(k, v);
            } else if (init instanceof Map) {
                for (const [k, v] of init) this.append(k, v);
            } else if (Array.isArray(init)) {
                for (const [k, v] of init) this.append(k, v);
            } else if (init) {
                for (const k of Object.keys(init)) this.append(k, init[k]);
            }
        }
        append(name, value) {
            const key = String(name).toLowerCase();
            const existing = this._map.get(key);
            this._map.set(key, existing === undefined ? String(value) : existing + ", " + value);
        }
        set(name, value) {
            this._map.set(String(name).toLowerCase(), String(value));
        }
        get(name) {
            const value = this._map.get(String(name).toLowerCase());
            return value === undefined ? null : value;
        }
        has(name) {
            return this._map.has(String(name).toLowerCase());
        }
        delete(name) {
            this._map.delete(String(name).toLowerCase());
        }
        entries() {
            return this._map.entries();
        }
        forEach(fn) {
            for (const [k, v] of this._map) fn(v, k, this);
        }
        [Symbol.iterator]() {
            return this._map.entries();
        }
    }

    class URLSearchParams {
        constructor(init) {
            this._entries = [];
            if (typeof init === "string") {
                const query = init.startsWith("?") ? init.slice(1) : init;
                if (query) {
                    for (const pair of query.split("&")) {
                        const [key, value = ""] = pair.split("=");
                        this._entries.push([decodeURIComponent(key), decodeURIComponent(value)]);
                    }
                }
            }
        }
        get(name) {
            const entry = this._entries.find(([k]) => k === name);
            return entry ? entry[1] : null;
        }
        getAll(name) {
            return this._entries.filter(([k]) => k === name).map(([, v]) => v);
        }
        has(name) {
            return this._entries.some(([k]) => k === name);
        }
        append(name, value) {
            this._entries.push([name, String(value)]);
        }
        set(name, value) {
            this._entries = this._entries.filter(([k]) => k !== name);
            this._entries.push([name, String(value)]);
        }
        entries() {
            return this._entries[Symbol.iterator]();
        }
        toString() {
            return this._entries.map(([k, v]) => encodeURIComponent(k) + "=" + encodeURIComponent(v)).join("&");
        }
        [Symbol.iterator]() {
            return this.entries();
        }
    }

    class URL {
        constructor(input, base) {
            let url = String(input);
            if (base !== undefined && !/^[a-zA-Z][a-zA-Z0-9+.-]*:/.test(url)) {
                const baseHref = base instanceof URL ? base.href : String(base);
                const originMatch = baseHref.match(/^([a-zA-Z][a-zA-Z0-9+.-]*:\/\/[^/?#]*)/);
                const origin = originMatch ? originMatch[1] : baseHref;
                url = url.startsWith("/") ? origin + url : origin + "/" + url;
            }
            const match = url.match(/^([a-zA-Z][a-zA-Z0-9+.-]*:)\/\/([^/?#]*)([^?#]*)(\?[^#]*)?(#.*)?$/);
            if (!match) {
                throw new TypeError(`invalid URL: ${url}`);
            }
            const [, protocol, host, path, search, hash] = match;
            this.protocol = protocol;
            this.host = host;
            const [hostname, port] = host.split(":");
            this.hostname = hostname;
            this.port = port || "";
            this.pathname = path || "/";
            this.search = search || "";
            this.hash = hash || "";
            this.href = url;
            this.searchParams = new URLSearchParams(this.search);
        }
        toString() {
            return this.href;
        }
    }

    function bodyToBytes(body) {
        if (body == null) return new Uint8Array(0);
        if (body instanceof Uint8Array) return body;
        if (body instanceof ArrayBuffer) return new Uint8Array(body);
        const text = String(body);
        const bytes = new Uint8Array(text.length);
        for (let i = 0; i < text.length; i++) bytes[i] = text.charCodeAt(i) & 0xff;
        return bytes;
    }

    function bytesToText(bytes) {
        let out = "";
        for (let i = 0; i < bytes.length; i++) out += String.fromCharCode(bytes[i]);
        return out;
    }

    class Request {
        constructor(input, init) {
            init = init || {};
            if (input instanceof Request) {
                this.url = input.url;
                this.method = (init.method || input.method).toUpperCase();
                this.headers = init.headers ? new Headers(init.headers) : new Headers(input.headers);
                this._body = init.body !== undefined ? init.body : input._body;
            } else {
                this.url = String(input);
                this.method = (init.method || "GET").toUpperCase();
                this.headers = new Headers(init.headers);
                this._body = init.body !== undefined ? init.body : null;
            }
        }
        async arrayBuffer() {
            return bodyToBytes(this._body).buffer;
        }
        async text() {
            return bytesToText(bodyToBytes(this._body));
        }
        async json() {
            return JSON.parse(await this.text());
        }
        clone() {
            return new Request(this);
        }
    }

    class Response {
        constructor(body, init) {
            init = init || {};
            this._body = body === undefined ? null : body;
            this.status = init.status === undefined ? 200 : init.status;
            this.statusText = init.statusText || "";
            this.headers = init.headers instanceof Headers ? init.headers : new Headers(init.headers);
            this.ok = this.status >= 200 && this.status < 300;
            this.webSocket = init.webSocket;
        }
        async arrayBuffer() {
            return bodyToBytes(this._body).buffer;
        }
        async text() {
            return bytesToText(bodyToBytes(this._body));
        }
        async json() {
            return JSON.parse(await this.text());
        }
        clone() {
            return new Response(this._body, {
                status: this.status,
                statusText: this.statusText,
                headers: this.headers,
                webSocket: this.webSocket,
            });
        }
    }

    globalThis.Headers = Headers;
    globalThis.URLSearchParams = URLSearchParams;
    globalThis.URL = URL;
    globalThis.Request = Request;
    globalThis.Response = Response;
})();
"#;

pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    ctx.eval::<(), _>(SOURCE)
}
